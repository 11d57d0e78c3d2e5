// Author: Lukas Bower
// Purpose: Looper callback that drains the kernel IPC channel whenever it becomes readable.

//! Bridge from descriptor readiness to transport command handling.

use std::os::fd::RawFd;
use std::rc::Rc;

use crate::looper::{CallbackAction, EventMask, LooperCallback};
use crate::transport::IpcTransport;

/// Drains all pending commands on every wake-up of the kernel descriptor.
///
/// The registration is never dropped: a failed drain is logged and the next
/// readiness edge tries again.
pub struct BinderCallback<T: IpcTransport + ?Sized> {
    transport: Rc<T>,
    wakeups: u64,
}

impl<T: IpcTransport + ?Sized> BinderCallback<T> {
    /// Drain `transport` on readiness.
    #[must_use]
    pub fn new(transport: Rc<T>) -> Self {
        Self {
            transport,
            wakeups: 0,
        }
    }

    /// Readiness callbacks received so far.
    #[must_use]
    pub const fn wakeups(&self) -> u64 {
        self.wakeups
    }
}

impl<T: IpcTransport + ?Sized> LooperCallback for BinderCallback<T> {
    fn handle_event(&mut self, fd: RawFd, events: EventMask) -> CallbackAction {
        self.wakeups += 1;
        if events.intersects(EventMask::ERROR | EventMask::HANGUP) {
            log::warn!("[pump] fd={fd} reported {events:?}");
        }
        match self.transport.handle_polled_commands() {
            Ok(stats) => log::debug!(
                "[pump] fd={fd} wake={wake} commands={commands} transactions={transactions} unroutable={unroutable}",
                wake = self.wakeups,
                commands = stats.commands,
                transactions = stats.transactions,
                unroutable = stats.unroutable
            ),
            Err(err) => log::warn!("[pump] fd={fd} drain failed: {err}"),
        }
        CallbackAction::Keep
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;
    use crate::transport::{DispatchTarget, DrainStats, ThreadPoolConfig, TransportError};

    #[derive(Default)]
    struct FlakyTransport {
        drains: Cell<usize>,
    }

    impl IpcTransport for FlakyTransport {
        fn configure_threadpool(&self, _config: ThreadPoolConfig) {}

        fn setup_polling(&self) -> RawFd {
            3
        }

        fn set_context_object(&self, _target: Rc<dyn DispatchTarget>) {}

        fn has_context_object(&self) -> bool {
            true
        }

        fn handle_polled_commands(&self) -> Result<DrainStats, TransportError> {
            let n = self.drains.get() + 1;
            self.drains.set(n);
            if n % 2 == 1 {
                Err(TransportError::Protocol("garbled".into()))
            } else {
                Ok(DrainStats::default())
            }
        }
    }

    #[test]
    fn keeps_registration_through_failures() {
        let transport = Rc::new(FlakyTransport::default());
        let mut callback = BinderCallback::new(Rc::clone(&transport));
        for events in [EventMask::INPUT, EventMask::INPUT | EventMask::HANGUP, EventMask::INPUT] {
            assert_eq!(callback.handle_event(3, events), CallbackAction::Keep);
        }
        assert_eq!(transport.drains.get(), 3);
        assert_eq!(callback.wakeups(), 3);
    }
}
