// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Publish the registry readiness property exactly once.
// Author: Lukas Bower
//! Readiness signal published once the context-manager claim has run.

use core::sync::atomic::{AtomicU8, Ordering};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

/// Errors raised while publishing readiness.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The property tool could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that was run.
        program: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The property tool exited unsuccessfully.
    #[error("{program} exited with {}", code.map_or_else(|| "a signal".to_owned(), |c| format!("status {c}")))]
    Status {
        /// Program that was run.
        program: PathBuf,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
    },
    /// The property file could not be updated.
    #[error("failed to update {path}: {source}")]
    Io {
        /// Property file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Keys and values must be single-line and keys must not contain `=`.
    #[error("invalid property '{0}'")]
    InvalidProperty(String),
    /// The signal was already published by this process.
    #[error("readiness already published")]
    AlreadyPublished,
}

/// Sink for the readiness property.
pub trait ReadinessPublisher {
    /// Set `key` to `value`.
    fn publish(&self, key: &str, value: &str) -> Result<(), PublishError>;
}

impl<P: ReadinessPublisher + ?Sized> ReadinessPublisher for Box<P> {
    fn publish(&self, key: &str, value: &str) -> Result<(), PublishError> {
        (**self).publish(key, value)
    }
}

fn check_property(key: &str, value: &str) -> Result<(), PublishError> {
    if key.is_empty() || key.contains(['=', '\n', ' ']) {
        return Err(PublishError::InvalidProperty(key.to_owned()));
    }
    if value.contains('\n') {
        return Err(PublishError::InvalidProperty(value.to_owned()));
    }
    Ok(())
}

/// Runs the platform `setprop` tool.
#[derive(Debug, Clone)]
pub struct SetpropPublisher {
    program: PathBuf,
}

impl SetpropPublisher {
    /// Use `program` as the property tool.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ReadinessPublisher for SetpropPublisher {
    fn publish(&self, key: &str, value: &str) -> Result<(), PublishError> {
        check_property(key, value)?;
        let status = Command::new(&self.program)
            .arg(key)
            .arg(value)
            .status()
            .map_err(|source| PublishError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !status.success() {
            return Err(PublishError::Status {
                program: self.program.clone(),
                code: status.code(),
            });
        }
        Ok(())
    }
}

/// Upserts `key=value` lines in a properties file.
#[derive(Debug, Clone)]
pub struct FilePublisher {
    path: PathBuf,
}

impl FilePublisher {
    /// Publish into the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> PublishError {
        PublishError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl ReadinessPublisher for FilePublisher {
    fn publish(&self, key: &str, value: &str) -> Result<(), PublishError> {
        check_property(key, value)?;
        let existing = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(self.io_err(err)),
        };

        let prefix = format!("{key}=");
        let mut replaced = false;
        let mut out = String::with_capacity(existing.len() + prefix.len() + value.len() + 1);
        for line in existing.lines() {
            if line.starts_with(&prefix) {
                if !replaced {
                    out.push_str(&prefix);
                    out.push_str(value);
                    out.push('\n');
                    replaced = true;
                }
                continue;
            }
            out.push_str(line);
            out.push('\n');
        }
        if !replaced {
            out.push_str(&prefix);
            out.push_str(value);
            out.push('\n');
        }

        let staging = self.path.with_extension("tmp");
        fs::write(&staging, out).map_err(|err| self.io_err(err))?;
        fs::rename(&staging, &self.path).map_err(|err| self.io_err(err))
    }
}

/// Publisher that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl ReadinessPublisher for NullPublisher {
    fn publish(&self, key: &str, value: &str) -> Result<(), PublishError> {
        log::info!("[ready] {key}={value} (not published)");
        Ok(())
    }
}

/// Outcome of the one readiness publication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadinessState {
    /// Not attempted yet.
    Pending = 0,
    /// Publisher accepted the property.
    Published = 1,
    /// Publication was attempted and failed.
    Failed = 2,
}

impl ReadinessState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Published,
            2 => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Latch guaranteeing the readiness property is attempted at most once.
#[derive(Debug, Default)]
pub struct ReadinessFlag {
    state: AtomicU8,
}

impl ReadinessFlag {
    /// New latch in the pending state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(ReadinessState::Pending as u8),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ReadinessState {
        ReadinessState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Publish through `publisher` unless an attempt was already made.
    ///
    /// The latch closes on the first attempt whether or not the publisher
    /// succeeds; later calls return [`PublishError::AlreadyPublished`]
    /// without reaching the publisher.
    pub fn publish_once(
        &self,
        publisher: &dyn ReadinessPublisher,
        key: &str,
        value: &str,
    ) -> Result<(), PublishError> {
        // Park in Failed while the publisher runs; overwritten on success.
        if self
            .state
            .compare_exchange(
                ReadinessState::Pending as u8,
                ReadinessState::Failed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(PublishError::AlreadyPublished);
        }
        publisher.publish(key, value)?;
        self.state
            .store(ReadinessState::Published as u8, Ordering::Release);
        log::info!("[ready] {key}={value}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;

    struct Counting {
        calls: Cell<usize>,
        fail: bool,
    }

    impl ReadinessPublisher for Counting {
        fn publish(&self, _key: &str, _value: &str) -> Result<(), PublishError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                Err(PublishError::InvalidProperty("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn latch_publishes_once() {
        let flag = ReadinessFlag::new();
        let publisher = Counting {
            calls: Cell::new(0),
            fail: false,
        };
        flag.publish_once(&publisher, "hwservicemanager.ready", "true")
            .unwrap();
        assert!(matches!(
            flag.publish_once(&publisher, "hwservicemanager.ready", "true"),
            Err(PublishError::AlreadyPublished)
        ));
        assert_eq!(publisher.calls.get(), 1);
        assert_eq!(flag.state(), ReadinessState::Published);
    }

    #[test]
    fn failed_attempt_still_closes_latch() {
        let flag = ReadinessFlag::new();
        let publisher = Counting {
            calls: Cell::new(0),
            fail: true,
        };
        assert!(flag.publish_once(&publisher, "k", "v").is_err());
        assert!(matches!(
            flag.publish_once(&publisher, "k", "v"),
            Err(PublishError::AlreadyPublished)
        ));
        assert_eq!(publisher.calls.get(), 1);
        assert_eq!(flag.state(), ReadinessState::Failed);
    }

    #[test]
    fn file_publisher_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("props");
        fs::write(&path, "ro.boot=1\nhwservicemanager.ready=false\n").unwrap();

        let publisher = FilePublisher::new(&path);
        publisher.publish("hwservicemanager.ready", "true").unwrap();
        publisher.publish("other.flag", "x").unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "ro.boot=1\nhwservicemanager.ready=true\nother.flag=x\n");
    }

    #[test]
    fn file_publisher_rejects_bad_keys() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = FilePublisher::new(dir.path().join("props"));
        assert!(matches!(
            publisher.publish("a=b", "true"),
            Err(PublishError::InvalidProperty(_))
        ));
    }

    #[test]
    fn setprop_reports_exit_status() {
        SetpropPublisher::new("true")
            .publish("hwservicemanager.ready", "true")
            .unwrap();
        let err = SetpropPublisher::new("false")
            .publish("hwservicemanager.ready", "true")
            .unwrap_err();
        assert!(matches!(err, PublishError::Status { code: Some(1), .. }), "{err}");
    }
}
