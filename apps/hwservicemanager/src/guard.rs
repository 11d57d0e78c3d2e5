// Author: Lukas Bower
//! Keeps the process alive without doing any work when the kernel channel
//! could not be acquired.
//!
//! The init system restarts a service that exits; a registry that cannot
//! reach its driver stays resident instead so it is not restarted in a loop.

use core::fmt;
use std::os::fd::RawFd;
use std::thread;

/// Why the process went idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleReason {
    /// Polling setup returned no usable descriptor.
    DescriptorUnavailable {
        /// Value returned by the transport.
        raw: RawFd,
    },
}

impl fmt::Display for IdleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DescriptorUnavailable { raw } => {
                write!(f, "binder descriptor unavailable (got {raw})")
            }
        }
    }
}

/// Entry point into the idle state.
#[derive(Debug)]
pub struct LivenessGuard;

impl LivenessGuard {
    /// Log the reason and hand back the idle token.
    pub fn engage(reason: IdleReason) -> IdleState {
        log::error!("[guard] failed to acquire binder FD; staying around but doing nothing");
        log::debug!("[guard] {reason}");
        IdleState { reason }
    }
}

/// Proof that bootstrap stopped short of the claim and the loop.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an idle state must be held or the process will exit"]
pub struct IdleState {
    reason: IdleReason,
}

impl IdleState {
    /// Reason recorded by [`LivenessGuard::engage`].
    #[must_use]
    pub const fn reason(&self) -> IdleReason {
        self.reason
    }

    /// Park the calling thread forever.
    pub fn hold(self) -> ! {
        log::info!("[guard] idling: {}", self.reason);
        loop {
            thread::park();
        }
    }
}
