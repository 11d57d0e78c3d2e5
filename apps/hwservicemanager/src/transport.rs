// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Transport and kernel-control seams between the bootstrap and the hwbinder driver.
// Author: Lukas Bower

//! Traits separating the bootstrap from the IPC driver it runs on.
//!
//! [`IpcTransport`] plays the role of the per-thread IPC state: it owns the
//! kernel channel, knows the in-process context object and drains pending
//! commands. [`KernelControl`] is the single privileged call used to claim the
//! context-manager role. Both are used from the one dispatch thread only,
//! so implementations rely on interior mutability rather than locks.

use core::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use thiserror::Error;

use crate::claim::ClaimError;

/// Binder status returned when a transaction code is not recognised.
pub const STATUS_UNKNOWN_TRANSACTION: i32 = -libc::EBADMSG;
/// Binder status returned for malformed arguments.
pub const STATUS_BAD_VALUE: i32 = -libc::EINVAL;
/// Binder status returned when no context object can receive a call.
pub const STATUS_DEAD_OBJECT: i32 = -libc::EPIPE;

/// Thread-pool shape requested from the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadPoolConfig {
    /// Total number of threads servicing the driver, caller included.
    pub max_threads: u32,
    /// The configuring thread joins dispatch itself.
    pub caller_will_join: bool,
}

impl ThreadPoolConfig {
    /// One thread, and it is the caller.
    #[must_use]
    pub const fn single_joined() -> Self {
        Self {
            max_threads: 1,
            caller_will_join: true,
        }
    }

    /// Threads the driver may ask us to spawn on top of the caller.
    #[must_use]
    pub const fn spawnable(self) -> u32 {
        if self.caller_will_join {
            self.max_threads.saturating_sub(1)
        } else {
            self.max_threads
        }
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self::single_joined()
    }
}

/// Kernel IPC channel handle suitable for a readiness wait.
///
/// The transport keeps the underlying descriptor open for the life of the
/// process; this value is only the registration key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PollableDescriptor(RawFd);

impl PollableDescriptor {
    /// Interpret a raw descriptor; negative values mean the channel is unavailable.
    #[must_use]
    pub const fn from_raw(raw: RawFd) -> Option<Self> {
        if raw < 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Raw descriptor value.
    #[must_use]
    pub const fn raw(self) -> RawFd {
        self.0
    }
}

/// Inbound call delivered to the context object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Transaction code.
    pub code: u32,
    /// Caller does not wait for a reply.
    pub one_way: bool,
    /// Raw payload.
    pub data: Vec<u8>,
}

/// Failure reported by a dispatch target for one transaction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Transaction code not implemented by the target.
    #[error("unknown transaction code {0:#010x}")]
    UnknownCode(u32),
    /// Payload could not be decoded.
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

impl DispatchError {
    /// Binder status code carried back to the caller.
    #[must_use]
    pub const fn status(&self) -> i32 {
        match self {
            Self::UnknownCode(_) => STATUS_UNKNOWN_TRANSACTION,
            Self::Malformed(_) => STATUS_BAD_VALUE,
        }
    }
}

/// Object the driver routes unaddressed calls to.
pub trait DispatchTarget {
    /// Handle one transaction and return the reply payload.
    fn on_transaction(&self, txn: &Transaction) -> Result<Vec<u8>, DispatchError>;
}

/// Counters describing one drain of the kernel channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Commands decoded, transactions included.
    pub commands: usize,
    /// Transactions handed to the context object.
    pub transactions: usize,
    /// Transactions refused because no context object was installed.
    pub unroutable: usize,
}

/// Errors raised by a transport while talking to its kernel channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// System call failure.
    #[error("{op} failed: {source}")]
    Io {
        /// Operation that failed.
        op: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The driver sent something this process cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Commands were drained before polling was set up.
    #[error("transport is not in polling mode")]
    NotPolling,
}

impl TransportError {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }
}

/// Per-process IPC state driven from the dispatch thread.
pub trait IpcTransport {
    /// Configure the thread pool. The result is not inspected by callers.
    fn configure_threadpool(&self, config: ThreadPoolConfig);

    /// Switch the calling thread to polled mode and return the kernel
    /// descriptor, or a negative value when the channel is unavailable.
    fn setup_polling(&self) -> RawFd;

    /// Install the default target for calls without an addressed recipient.
    fn set_context_object(&self, target: Rc<dyn DispatchTarget>);

    /// Return `true` once a context object has been installed.
    fn has_context_object(&self) -> bool;

    /// Drain every pending kernel command on the calling thread.
    fn handle_polled_commands(&self) -> Result<DrainStats, TransportError>;
}

/// Privileged kernel call declaring this process the context manager.
pub trait KernelControl {
    /// Claim the singleton context-manager role for `fd`.
    fn claim_singleton_role(&self, fd: PollableDescriptor) -> Result<(), ClaimError>;
}

impl<K: KernelControl + ?Sized> KernelControl for Rc<K> {
    fn claim_singleton_role(&self, fd: PollableDescriptor) -> Result<(), ClaimError> {
        (**self).claim_singleton_role(fd)
    }
}

/// Transport standing in for a driver that could not be opened.
///
/// Polling setup reports an unavailable descriptor, which sends the
/// bootstrap into the idle state after registrations have run.
#[derive(Default)]
pub struct UnavailableTransport {
    context: ContextSlot,
}

impl UnavailableTransport {
    /// New transport with no kernel channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IpcTransport for UnavailableTransport {
    fn configure_threadpool(&self, _config: ThreadPoolConfig) {}

    fn setup_polling(&self) -> RawFd {
        -1
    }

    fn set_context_object(&self, target: Rc<dyn DispatchTarget>) {
        self.context.install(target);
    }

    fn has_context_object(&self) -> bool {
        self.context.is_installed()
    }

    fn handle_polled_commands(&self) -> Result<DrainStats, TransportError> {
        Err(TransportError::NotPolling)
    }
}

impl KernelControl for UnavailableTransport {
    fn claim_singleton_role(&self, _fd: PollableDescriptor) -> Result<(), ClaimError> {
        Err(ClaimError::Rejected {
            errno: libc::ENODEV,
        })
    }
}

/// Result of routing one transaction through a [`ContextSlot`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Routed {
    Reply(Vec<u8>),
    Failed(DispatchError),
    Unroutable,
}

/// Storage for the installed context object, shared by transports.
#[derive(Default)]
pub(crate) struct ContextSlot {
    target: RefCell<Option<Rc<dyn DispatchTarget>>>,
}

impl ContextSlot {
    pub(crate) fn install(&self, target: Rc<dyn DispatchTarget>) {
        if self.target.borrow_mut().replace(target).is_some() {
            log::warn!("[ipc] context object replaced");
        }
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.target.borrow().is_some()
    }

    pub(crate) fn route(&self, txn: &Transaction, stats: &mut DrainStats) -> Routed {
        // Clone out so a target may re-enter the transport.
        let target = self.target.borrow().clone();
        let Some(target) = target else {
            log::warn!(
                "[ipc] dropping transaction {code:#010x}: no context object",
                code = txn.code
            );
            stats.unroutable += 1;
            return Routed::Unroutable;
        };
        stats.transactions += 1;
        match target.on_transaction(txn) {
            Ok(reply) => Routed::Reply(reply),
            Err(err) => {
                log::debug!("[ipc] transaction {code:#010x}: {err}", code = txn.code);
                Routed::Failed(err)
            }
        }
    }
}
