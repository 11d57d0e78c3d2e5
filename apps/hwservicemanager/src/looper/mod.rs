// Author: Lukas Bower
// Purpose: Readiness-based event loop dispatching descriptor callbacks for the service manager.

//! Descriptor event loop.
//!
//! [`Looper`] owns a set of descriptor registrations, each bound to a
//! [`LooperCallback`]. One iteration is exactly one blocking wait on the
//! [`PollBackend`] followed by dispatch of every ready descriptor. The
//! callback's [`CallbackAction`] decides whether the descriptor stays
//! registered; the looper never drops a registration on its own.
//!
//! "Forever" is a [`LoopPolicy`] so tests can run a bounded number of
//! iterations through the same code path as the service. A forever loop
//! never returns: failed waits are logged, backed off and retried.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::EpollBackend;

use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::thread;
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Readiness conditions a registration listens for or a wait reports.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        /// Descriptor is readable.
        const INPUT = 1 << 0;
        /// Descriptor is writable.
        const OUTPUT = 1 << 1;
        /// Error condition (always reported).
        const ERROR = 1 << 2;
        /// Peer hung up (always reported).
        const HANGUP = 1 << 3;
    }
}

/// What to do with a registration after its callback ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    /// Keep receiving callbacks.
    Keep,
    /// Drop the registration.
    Remove,
}

/// Handler bound to one registered descriptor.
pub trait LooperCallback {
    /// Called when `fd` reports `events`.
    fn handle_event(&mut self, fd: RawFd, events: EventMask) -> CallbackAction;
}

/// Descriptor reported ready by a backend wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadyEvent {
    /// Ready descriptor.
    pub fd: RawFd,
    /// Conditions reported.
    pub events: EventMask,
}

/// Readiness wait primitive underneath the looper.
pub trait PollBackend {
    /// Start watching `fd` for `mask`.
    fn register(&mut self, fd: RawFd, mask: EventMask) -> io::Result<()>;

    /// Change the mask of an already-watched descriptor.
    fn modify(&mut self, fd: RawFd, mask: EventMask) -> io::Result<()>;

    /// Stop watching `fd`.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block until a watched descriptor is ready or `timeout` elapses;
    /// `None` waits indefinitely. Ready descriptors are appended to `ready`.
    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<ReadyEvent>) -> io::Result<()>;
}

/// How long [`Looper::run`] keeps iterating.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopPolicy {
    /// Never stop.
    Forever,
    /// Stop after this many waits.
    Iterations(u64),
}

/// First pause after a failed wait under [`LoopPolicy::Forever`].
pub const WAIT_RETRY_BACKOFF: Duration = Duration::from_millis(1);
/// Longest pause between failed waits.
pub const WAIT_RETRY_BACKOFF_MAX: Duration = Duration::from_secs(1);

impl LoopPolicy {
    const fn allows(self, completed: u64) -> bool {
        match self {
            Self::Forever => true,
            Self::Iterations(limit) => completed < limit,
        }
    }
}

/// Errors raised by the looper.
#[derive(Debug, Error)]
pub enum LooperError {
    /// Negative descriptors cannot be registered.
    #[error("invalid descriptor {0}")]
    InvalidDescriptor(RawFd),
    /// A registration must listen for something.
    #[error("empty event mask for descriptor {0}")]
    EmptyMask(RawFd),
    /// The backend refused the registration.
    #[error("failed to register descriptor {fd}: {source}")]
    Register {
        /// Descriptor being registered.
        fd: RawFd,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The blocking wait failed.
    #[error("wait failed: {0}")]
    Wait(#[source] io::Error),
}

/// Result of one [`Looper::poll_once`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollResult {
    /// Callbacks invoked.
    pub dispatched: usize,
    /// Registrations dropped at a callback's request.
    pub removed: usize,
}

struct Registration {
    mask: EventMask,
    callback: Box<dyn LooperCallback>,
}

/// Event loop over a [`PollBackend`].
pub struct Looper<B: PollBackend> {
    backend: B,
    registrations: BTreeMap<RawFd, Registration>,
    ready: Vec<ReadyEvent>,
}

impl<B: PollBackend> Looper<B> {
    /// Wrap `backend`.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            registrations: BTreeMap::new(),
            ready: Vec::new(),
        }
    }

    /// Register `fd`, replacing any existing registration for it.
    pub fn add_fd(
        &mut self,
        fd: RawFd,
        mask: EventMask,
        callback: Box<dyn LooperCallback>,
    ) -> Result<(), LooperError> {
        if fd < 0 {
            return Err(LooperError::InvalidDescriptor(fd));
        }
        if mask.is_empty() {
            return Err(LooperError::EmptyMask(fd));
        }

        let result = if self.registrations.contains_key(&fd) {
            self.backend.modify(fd, mask)
        } else {
            self.backend.register(fd, mask)
        };
        result.map_err(|source| LooperError::Register { fd, source })?;

        if self
            .registrations
            .insert(fd, Registration { mask, callback })
            .is_some()
        {
            log::debug!("[looper] fd={fd} callback replaced");
        }
        log::debug!("[looper] fd={fd} registered mask={mask:?}");
        Ok(())
    }

    /// Drop the registration for `fd`. Returns `false` if none existed.
    pub fn remove_fd(&mut self, fd: RawFd) -> bool {
        if self.registrations.remove(&fd).is_none() {
            return false;
        }
        if let Err(err) = self.backend.deregister(fd) {
            log::warn!("[looper] fd={fd} deregister failed: {err}");
        }
        true
    }

    /// Number of live registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Return `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Mask registered for `fd`.
    #[must_use]
    pub fn mask(&self, fd: RawFd) -> Option<EventMask> {
        self.registrations.get(&fd).map(|reg| reg.mask)
    }

    /// Backend, for inspection.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Wait once and dispatch every ready descriptor.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<PollResult, LooperError> {
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        let waited = self.backend.wait(timeout, &mut ready);
        let mut result = PollResult::default();

        if let Err(err) = waited {
            self.ready = ready;
            return Err(LooperError::Wait(err));
        }

        for event in &ready {
            // An earlier callback in this batch may have removed it.
            let Some(reg) = self.registrations.get_mut(&event.fd) else {
                continue;
            };
            result.dispatched += 1;
            if reg.callback.handle_event(event.fd, event.events) == CallbackAction::Remove {
                self.remove_fd(event.fd);
                result.removed += 1;
            }
        }

        self.ready = ready;
        Ok(result)
    }

    /// Poll with an indefinite timeout until `policy` says stop and return
    /// the number of completed iterations.
    ///
    /// Under [`LoopPolicy::Iterations`] a failed wait is returned as
    /// [`LooperError::Wait`]. Under [`LoopPolicy::Forever`] this never
    /// returns: a failed wait is logged (first failure, then at powers of
    /// two), followed by a doubling pause capped at
    /// [`WAIT_RETRY_BACKOFF_MAX`], and the loop carries on.
    pub fn run(&mut self, policy: LoopPolicy) -> Result<u64, LooperError> {
        let mut completed = 0u64;
        let mut failures = 0u64;
        let mut backoff = WAIT_RETRY_BACKOFF;
        while policy.allows(completed) {
            match self.poll_once(None) {
                Ok(_) => {
                    if failures > 0 {
                        log::info!("[looper] wait recovered after {failures} failures");
                        failures = 0;
                        backoff = WAIT_RETRY_BACKOFF;
                    }
                }
                Err(err) if policy == LoopPolicy::Forever => {
                    failures += 1;
                    if failures.is_power_of_two() {
                        log::error!("[looper] wait failed ({failures} in a row): {err}");
                    }
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(WAIT_RETRY_BACKOFF_MAX);
                    continue;
                }
                Err(err) => return Err(err),
            }
            completed += 1;
        }
        Ok(completed)
    }
}
