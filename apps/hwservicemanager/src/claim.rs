// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Two-step context-manager claim with ordering enforced by the type system.
// Author: Lukas Bower

//! Context-manager claim protocol.
//!
//! Installing the in-process dispatch target must happen before the kernel
//! is told that this process is the context manager; otherwise calls landing
//! in between have nowhere to go. The claim is a typestate:
//! [`ContextManagerClaim<Unclaimed>`] can only install, and only the
//! [`ContextManagerClaim<DispatchTargetInstalled>`] it returns can claim.

use core::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use thiserror::Error;

use crate::context::ProcessContext;
use crate::transport::{DispatchTarget, IpcTransport, KernelControl, PollableDescriptor};

/// Progress of the context-manager claim for this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimState {
    /// Nothing done yet.
    Unclaimed,
    /// Context object installed; kernel not yet told.
    DispatchTargetInstalled,
    /// Kernel accepted the claim.
    Claimed,
    /// Kernel refused the claim.
    Rejected,
}

impl ClaimState {
    /// Short label used in log lines.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Unclaimed => "unclaimed",
            Self::DispatchTargetInstalled => "dispatch-target-installed",
            Self::Claimed => "claimed",
            Self::Rejected => "rejected",
        }
    }

    /// Move to `next`, refusing anything but the forward edges.
    pub fn advance(&mut self, next: ClaimState) -> Result<(), ClaimError> {
        let legal = matches!(
            (*self, next),
            (Self::Unclaimed, Self::DispatchTargetInstalled)
                | (Self::DispatchTargetInstalled, Self::Claimed)
                | (Self::DispatchTargetInstalled, Self::Rejected)
        );
        if !legal {
            return Err(ClaimError::OutOfOrder {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors raised by the claim protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClaimError {
    /// The kernel refused the privileged call, e.g. another process already
    /// holds the role (`EBUSY`) or this one lacks permission (`EPERM`).
    #[error("kernel rejected context-manager claim: {}", io::Error::from_raw_os_error(*errno))]
    Rejected {
        /// Raw errno from the driver.
        errno: i32,
    },
    /// The claim was attempted on an unusable descriptor.
    #[error("invalid descriptor {0} for context-manager claim")]
    InvalidDescriptor(RawFd),
    /// A state transition skipped or repeated a step.
    #[error("claim state cannot move from {from} to {to}")]
    OutOfOrder {
        /// State before the attempt.
        from: ClaimState,
        /// Requested state.
        to: ClaimState,
    },
}

/// Typestate marker: nothing installed yet.
#[derive(Debug)]
pub struct Unclaimed;

/// Typestate marker: context object installed, kernel not yet told.
#[derive(Debug)]
pub struct DispatchTargetInstalled;

/// The claim protocol, parameterised by how far it has progressed.
#[derive(Debug)]
#[must_use = "an unfinished claim leaves the kernel unaware of the context manager"]
pub struct ContextManagerClaim<S> {
    _state: S,
}

impl ContextManagerClaim<Unclaimed> {
    /// Begin a claim. The sequencer creates exactly one per process.
    pub fn new() -> Self {
        Self { _state: Unclaimed }
    }

    /// Step (a): install `target` as the transport's context object.
    pub fn install_dispatch_target<T>(
        self,
        transport: &T,
        target: Rc<dyn DispatchTarget>,
        ctx: &ProcessContext,
    ) -> Result<ContextManagerClaim<DispatchTargetInstalled>, ClaimError>
    where
        T: IpcTransport + ?Sized,
    {
        ctx.advance_claim(ClaimState::DispatchTargetInstalled)?;
        transport.set_context_object(target);
        log::info!("[claim] context object installed");
        Ok(ContextManagerClaim {
            _state: DispatchTargetInstalled,
        })
    }
}

impl Default for ContextManagerClaim<Unclaimed> {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextManagerClaim<DispatchTargetInstalled> {
    /// Step (b): issue the privileged kernel call.
    ///
    /// A refusal is reported through [`ClaimOutcome::Rejected`]; what to do
    /// about it is the caller's decision.
    pub fn claim<K>(
        self,
        kernel: &K,
        fd: PollableDescriptor,
        ctx: &ProcessContext,
    ) -> Result<ClaimOutcome, ClaimError>
    where
        K: KernelControl + ?Sized,
    {
        match kernel.claim_singleton_role(fd) {
            Ok(()) => {
                ctx.advance_claim(ClaimState::Claimed)?;
                log::info!("[claim] fd={} is now the context manager", fd.raw());
                Ok(ClaimOutcome::Claimed)
            }
            Err(err) => {
                ctx.advance_claim(ClaimState::Rejected)?;
                log::error!("[claim] fd={}: {err}", fd.raw());
                Ok(ClaimOutcome::Rejected(err))
            }
        }
    }
}

/// Result of the kernel half of the claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This process is the context manager.
    Claimed,
    /// The kernel refused; the context object is still installed in-process.
    Rejected(ClaimError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_only_moves_forward() {
        let mut state = ClaimState::Unclaimed;
        assert!(state.advance(ClaimState::Claimed).is_err());
        state.advance(ClaimState::DispatchTargetInstalled).unwrap();
        assert!(state.advance(ClaimState::DispatchTargetInstalled).is_err());
        state.advance(ClaimState::Rejected).unwrap();
        assert_eq!(
            state.advance(ClaimState::Claimed),
            Err(ClaimError::OutOfOrder {
                from: ClaimState::Rejected,
                to: ClaimState::Claimed,
            })
        );
    }

    #[test]
    fn rejection_renders_errno() {
        let err = ClaimError::Rejected {
            errno: libc::EBUSY,
        };
        assert!(err.to_string().contains("busy"), "{err}");
    }
}
