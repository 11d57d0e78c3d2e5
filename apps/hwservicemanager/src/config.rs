// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load and validate the hwservicemanager TOML configuration.
// Author: Lukas Bower

//! Service configuration.
//!
//! Every key is optional; an absent file section keeps the defaults below,
//! which match the values the service has always hard-coded.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Instance name the registry and token manager register under.
pub const DEFAULT_INSTANCE: &str = "manager";
/// Kernel device the hwbinder transport opens.
pub const DEFAULT_DEVICE: &str = "/dev/hwbinder";
/// Property announcing that the registry accepts registrations.
pub const DEFAULT_READY_KEY: &str = "hwservicemanager.ready";
/// Value written to [`DEFAULT_READY_KEY`].
pub const DEFAULT_READY_VALUE: &str = "true";
/// Property tool used by the setprop publisher.
pub const DEFAULT_SETPROP: &str = "/system/bin/setprop";
/// Properties file used by the file publisher.
pub const DEFAULT_PROPS_FILE: &str = "/dev/hwservicemanager.props";

/// Validation failures for a parsed configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required string was empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),
    /// The thread pool must contain at least the calling thread.
    #[error("transport max_threads must be >= 1")]
    NoThreads,
    /// Property keys may not contain `=`, spaces or newlines.
    #[error("readiness key '{0}' is not a valid property name")]
    BadKey(String),
}

/// Which kernel IPC transport to drive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// The hwbinder driver.
    #[default]
    Hwbinder,
    /// An in-process datagram pair, for hosts without the driver.
    Loopback,
}

/// Where the readiness property goes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherKind {
    /// Run the platform property tool.
    #[default]
    Setprop,
    /// Upsert into a properties file.
    File,
    /// Only log.
    None,
}

/// Reaction to the kernel refusing the context-manager claim.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimFailurePolicy {
    /// Log and keep serving in-process.
    #[default]
    Continue,
    /// Stop bootstrap with an error.
    Abort,
}

/// `[registry]` section.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrySection {
    /// Self-registration instance name.
    pub instance: String,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            instance: DEFAULT_INSTANCE.to_owned(),
        }
    }
}

/// `[transport]` section.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSection {
    /// Transport selection.
    pub kind: TransportKind,
    /// Device node for the hwbinder transport.
    pub device: PathBuf,
    /// Dispatch threads, the caller included.
    pub max_threads: u32,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            device: PathBuf::from(DEFAULT_DEVICE),
            max_threads: 1,
        }
    }
}

/// `[readiness]` section.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessSection {
    /// Publisher selection.
    pub publisher: PublisherKind,
    /// Property name.
    pub key: String,
    /// Property value.
    pub value: String,
    /// Property tool for [`PublisherKind::Setprop`].
    pub setprop: PathBuf,
    /// Target file for [`PublisherKind::File`].
    pub file: PathBuf,
}

impl Default for ReadinessSection {
    fn default() -> Self {
        Self {
            publisher: PublisherKind::default(),
            key: DEFAULT_READY_KEY.to_owned(),
            value: DEFAULT_READY_VALUE.to_owned(),
            setprop: PathBuf::from(DEFAULT_SETPROP),
            file: PathBuf::from(DEFAULT_PROPS_FILE),
        }
    }
}

/// `[claim]` section.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClaimSection {
    /// Reaction to a refused claim.
    pub on_failure: ClaimFailurePolicy,
}

/// Complete service configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Registry settings.
    pub registry: RegistrySection,
    /// Transport settings.
    pub transport: TransportSection,
    /// Readiness settings.
    pub readiness: ReadinessSection,
    /// Claim settings.
    pub claim: ClaimSection,
}

impl Config {
    /// Read, parse and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml_str(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.instance.trim().is_empty() {
            return Err(ConfigError::Empty("registry instance"));
        }
        if self.transport.max_threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.transport.kind == TransportKind::Hwbinder
            && self.transport.device.as_os_str().is_empty()
        {
            return Err(ConfigError::Empty("transport device"));
        }
        let key = &self.readiness.key;
        if key.is_empty() {
            return Err(ConfigError::Empty("readiness key"));
        }
        if key.contains(['=', ' ', '\n']) {
            return Err(ConfigError::BadKey(key.clone()));
        }
        if self.readiness.value.is_empty() {
            return Err(ConfigError::Empty("readiness value"));
        }
        match self.readiness.publisher {
            PublisherKind::Setprop if self.readiness.setprop.as_os_str().is_empty() => {
                Err(ConfigError::Empty("readiness setprop"))
            }
            PublisherKind::File if self.readiness.file.as_os_str().is_empty() => {
                Err(ConfigError::Empty("readiness file"))
            }
            _ => Ok(()),
        }
    }

    /// Render as TOML.
    pub fn render(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config")
    }
}
