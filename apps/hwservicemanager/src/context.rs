// Author: Lukas Bower
//! Process-wide state established once during bootstrap.

use core::cell::{Cell, OnceCell};
use core::fmt;
use std::rc::Rc;

use hidl_registry::{HidlInterface, RegistryService};

use crate::claim::{ClaimError, ClaimState};
use crate::readiness::ReadinessFlag;
use crate::transport::PollableDescriptor;

/// The registry, the kernel descriptor, the claim state and the readiness
/// latch, owned together and handed to components by reference.
///
/// Handles are set once; later attempts are refused so the process keeps one
/// registry and one descriptor for its whole life.
pub struct ProcessContext {
    registry: Rc<dyn RegistryService>,
    token_manager: OnceCell<Rc<dyn HidlInterface>>,
    descriptor: OnceCell<PollableDescriptor>,
    claim: Cell<ClaimState>,
    readiness: ReadinessFlag,
}

/// A set-once handle was offered a second value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0} is already established")]
pub struct AlreadyEstablished(pub &'static str);

impl ProcessContext {
    /// Build the context around the registry handle.
    #[must_use]
    pub fn new(registry: Rc<dyn RegistryService>) -> Self {
        Self {
            registry,
            token_manager: OnceCell::new(),
            descriptor: OnceCell::new(),
            claim: Cell::new(ClaimState::Unclaimed),
            readiness: ReadinessFlag::new(),
        }
    }

    /// Registry handle.
    #[must_use]
    pub fn registry(&self) -> &Rc<dyn RegistryService> {
        &self.registry
    }

    /// Token manager handle, once instantiated.
    #[must_use]
    pub fn token_manager(&self) -> Option<&Rc<dyn HidlInterface>> {
        self.token_manager.get()
    }

    pub(crate) fn attach_token_manager(
        &self,
        token_manager: Rc<dyn HidlInterface>,
    ) -> Result<(), AlreadyEstablished> {
        self.token_manager
            .set(token_manager)
            .map_err(|_| AlreadyEstablished("token manager"))
    }

    /// Kernel descriptor, once acquired.
    #[must_use]
    pub fn descriptor(&self) -> Option<PollableDescriptor> {
        self.descriptor.get().copied()
    }

    pub(crate) fn attach_descriptor(
        &self,
        descriptor: PollableDescriptor,
    ) -> Result<(), AlreadyEstablished> {
        self.descriptor
            .set(descriptor)
            .map_err(|_| AlreadyEstablished("kernel descriptor"))
    }

    /// Current claim state.
    #[must_use]
    pub fn claim_state(&self) -> ClaimState {
        self.claim.get()
    }

    pub(crate) fn advance_claim(&self, next: ClaimState) -> Result<(), ClaimError> {
        let mut state = self.claim.get();
        state.advance(next)?;
        self.claim.set(state);
        Ok(())
    }

    /// Readiness latch.
    #[must_use]
    pub fn readiness(&self) -> &ReadinessFlag {
        &self.readiness
    }
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("registry", &self.registry.descriptor().to_string())
            .field("token_manager", &self.token_manager.get().is_some())
            .field("descriptor", &self.descriptor.get())
            .field("claim", &self.claim.get())
            .field("readiness", &self.readiness.state())
            .finish()
    }
}
