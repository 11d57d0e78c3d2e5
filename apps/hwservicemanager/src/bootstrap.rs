// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Ordered, run-once bootstrap of the hwservicemanager core.
// Author: Lukas Bower

//! Bootstrap sequencer.
//!
//! [`Bootstrap::run`] performs the ten startup steps exactly once and in a
//! fixed order, recorded by a [`PhaseTracker`] that refuses reordering or
//! re-entry:
//!
//! 1. configure the thread pool;
//! 2. instantiate the registry;
//! 3. register the registry into itself under every name of its chain;
//! 4. instantiate the token manager;
//! 5. register the token manager into the registry;
//! 6. acquire the kernel descriptor, going idle if it is unavailable;
//! 7. register the descriptor with the looper;
//! 8. install the context object, then claim the context-manager role;
//! 9. publish readiness;
//! 10. run the event loop.
//!
//! Registration failures in steps 3 and 5 are logged per name and never stop
//! the sequence. Only a failed looper registration is a setup failure.

use core::fmt;
use std::rc::Rc;

use hidl_registry::{HidlInterface, RegistryService, ServiceManager, TokenManager};
use thiserror::Error;

use crate::claim::{ClaimError, ClaimOutcome, ContextManagerClaim};
use crate::config::{
    ClaimFailurePolicy, Config, DEFAULT_INSTANCE, DEFAULT_READY_KEY, DEFAULT_READY_VALUE,
};
use crate::context::{AlreadyEstablished, ProcessContext};
use crate::guard::{IdleReason, IdleState, LivenessGuard};
use crate::looper::{EventMask, LoopPolicy, Looper, LooperError, PollBackend};
use crate::pump::BinderCallback;
use crate::readiness::{ReadinessPublisher, ReadinessState};
use crate::stub::ManagerStub;
use crate::transport::{IpcTransport, KernelControl, PollableDescriptor, ThreadPoolConfig};

/// Exit status for a failed looper registration.
pub const EXIT_SETUP_FAILURE: u8 = 255;
/// Exit status for every other bootstrap error.
pub const EXIT_FAILURE: u8 = 1;

/// Bootstrap phases executed exactly once in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapPhase {
    /// Step 1.
    ConfigureThreadPool,
    /// Step 2.
    InstantiateRegistry,
    /// Step 3.
    RegisterRegistry,
    /// Step 4.
    InstantiateTokenManager,
    /// Step 5.
    RegisterTokenManager,
    /// Step 6.
    AcquireDescriptor,
    /// Step 7.
    RegisterDescriptor,
    /// Step 8.
    ClaimContextManager,
    /// Step 9.
    PublishReadiness,
    /// Step 10.
    EnterLoop,
}

impl BootstrapPhase {
    /// Stable name used in log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigureThreadPool => "ConfigureThreadPool",
            Self::InstantiateRegistry => "InstantiateRegistry",
            Self::RegisterRegistry => "RegisterRegistry",
            Self::InstantiateTokenManager => "InstantiateTokenManager",
            Self::RegisterTokenManager => "RegisterTokenManager",
            Self::AcquireDescriptor => "AcquireDescriptor",
            Self::RegisterDescriptor => "RegisterDescriptor",
            Self::ClaimContextManager => "ClaimContextManager",
            Self::PublishReadiness => "PublishReadiness",
            Self::EnterLoop => "EnterLoop",
        }
    }
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order in which [`Bootstrap::run`] executes its phases.
pub const ORDERING: &[BootstrapPhase] = &[
    BootstrapPhase::ConfigureThreadPool,
    BootstrapPhase::InstantiateRegistry,
    BootstrapPhase::RegisterRegistry,
    BootstrapPhase::InstantiateTokenManager,
    BootstrapPhase::RegisterTokenManager,
    BootstrapPhase::AcquireDescriptor,
    BootstrapPhase::RegisterDescriptor,
    BootstrapPhase::ClaimContextManager,
    BootstrapPhase::PublishReadiness,
    BootstrapPhase::EnterLoop,
];

/// Tracks bootstrap progress and rejects re-entry or phase reordering.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    next: usize,
}

impl PhaseTracker {
    /// Tracker positioned before the first phase.
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Mark `phase` as started.
    pub fn advance(&mut self, phase: BootstrapPhase) -> Result<(), BootstrapError> {
        let Some(&expected) = ORDERING.get(self.next) else {
            return Err(BootstrapError::Phase {
                expected: "completion",
                saw: phase,
            });
        };
        if expected != phase {
            return Err(BootstrapError::Phase {
                expected: expected.as_str(),
                saw: phase,
            });
        }
        log::debug!("[boot] phase {phase}");
        self.next += 1;
        Ok(())
    }

    /// Phases started so far, in order.
    #[must_use]
    pub fn completed(&self) -> &'static [BootstrapPhase] {
        &ORDERING[..self.next]
    }
}

/// Fatal bootstrap errors.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The kernel descriptor could not be registered with the looper.
    #[error("failed to add binder FD to looper: {0}")]
    Setup(#[source] LooperError),
    /// The kernel refused the claim and the configuration asks to abort.
    #[error("context-manager claim rejected: {0}")]
    ClaimRejected(#[source] ClaimError),
    /// The claim protocol itself was misused.
    #[error("claim protocol failed: {0}")]
    Claim(#[source] ClaimError),
    /// A bounded event loop stopped on a wait failure.
    #[error("event loop failed: {0}")]
    Loop(#[source] LooperError),
    /// A phase ran out of order.
    #[error("bootstrap phase order violation: expected {expected}, saw {saw}")]
    Phase {
        /// Phase the tracker expected.
        expected: &'static str,
        /// Phase that was attempted.
        saw: BootstrapPhase,
    },
    /// A set-once process handle was offered twice.
    #[error(transparent)]
    Reassigned(#[from] AlreadyEstablished),
}

impl BootstrapError {
    /// Process exit status for this error.
    #[must_use]
    pub const fn exit_status(&self) -> u8 {
        match self {
            Self::Setup(_) => EXIT_SETUP_FAILURE,
            _ => EXIT_FAILURE,
        }
    }
}

/// Factories for the two collaborators, invoked at steps 2 and 4.
pub trait Collaborators {
    /// Build the registry.
    fn registry(&mut self) -> Rc<dyn RegistryService>;
    /// Build the token manager.
    fn token_manager(&mut self) -> Rc<dyn HidlInterface>;
}

/// Production collaborators: [`ServiceManager`] and [`TokenManager`].
#[derive(Debug, Default)]
pub struct DefaultCollaborators {
    registry: Option<Rc<ServiceManager>>,
}

impl DefaultCollaborators {
    /// Collaborators not yet instantiated.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry built at step 2, if it has run.
    #[must_use]
    pub fn service_manager(&self) -> Option<&Rc<ServiceManager>> {
        self.registry.as_ref()
    }
}

impl Collaborators for DefaultCollaborators {
    fn registry(&mut self) -> Rc<dyn RegistryService> {
        let registry = Rc::new(ServiceManager::new());
        self.registry = Some(Rc::clone(&registry));
        registry
    }

    fn token_manager(&mut self) -> Rc<dyn HidlInterface> {
        Rc::new(TokenManager::new())
    }
}

/// Knobs the sequencer reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootSettings {
    /// Instance name for both self-registrations.
    pub instance: String,
    /// Thread pool requested at step 1.
    pub threadpool: ThreadPoolConfig,
    /// Readiness property name.
    pub ready_key: String,
    /// Readiness property value.
    pub ready_value: String,
    /// Reaction to a refused claim.
    pub on_claim_failure: ClaimFailurePolicy,
}

impl BootSettings {
    /// Derive settings from a validated configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            instance: config.registry.instance.clone(),
            threadpool: ThreadPoolConfig {
                max_threads: config.transport.max_threads,
                caller_will_join: true,
            },
            ready_key: config.readiness.key.clone(),
            ready_value: config.readiness.value.clone(),
            on_claim_failure: config.claim.on_failure,
        }
    }
}

impl Default for BootSettings {
    fn default() -> Self {
        Self {
            instance: DEFAULT_INSTANCE.to_owned(),
            threadpool: ThreadPoolConfig::single_joined(),
            ready_key: DEFAULT_READY_KEY.to_owned(),
            ready_value: DEFAULT_READY_VALUE.to_owned(),
            on_claim_failure: ClaimFailurePolicy::Continue,
        }
    }
}

/// Which collaborator a failed registration belonged to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    /// The registry registering itself.
    Manager,
    /// The token manager registered into the registry.
    TokenManager,
}

/// One refused `add`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationFailure {
    /// Whose chain the name came from.
    pub owner: Owner,
    /// Interface name that was refused, as the chain reported it.
    pub interface: String,
}

/// How bootstrap ended.
#[derive(Debug)]
pub enum Terminal {
    /// The descriptor was unavailable; the caller must hold the idle state.
    Idle(IdleState),
    /// A bounded loop policy ran to completion.
    LoopEnded {
        /// Waits completed.
        iterations: u64,
    },
}

/// Everything observable about a finished bootstrap.
#[derive(Debug)]
pub struct BootReport {
    /// Phases started, in order.
    pub phases: Vec<BootstrapPhase>,
    /// Refused registrations from steps 3 and 5.
    pub registration_failures: Vec<RegistrationFailure>,
    /// Result of step 8, if reached.
    pub claim: Option<ClaimOutcome>,
    /// Readiness latch after step 9.
    pub readiness: ReadinessState,
    /// How the run ended.
    pub terminal: Terminal,
    /// Process context built during the run.
    pub context: ProcessContext,
}

impl BootReport {
    /// Return `true` when bootstrap parked in the idle state.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.terminal, Terminal::Idle(_))
    }
}

/// The sequencer and everything it drives.
pub struct Bootstrap<T, K, B>
where
    T: IpcTransport + 'static,
    K: KernelControl,
    B: PollBackend,
{
    settings: BootSettings,
    transport: Rc<T>,
    kernel: K,
    publisher: Box<dyn ReadinessPublisher>,
    looper: Looper<B>,
    phases: PhaseTracker,
}

impl<T, K, B> Bootstrap<T, K, B>
where
    T: IpcTransport + 'static,
    K: KernelControl,
    B: PollBackend,
{
    /// Assemble a sequencer.
    pub fn new(
        settings: BootSettings,
        transport: Rc<T>,
        kernel: K,
        publisher: Box<dyn ReadinessPublisher>,
        looper: Looper<B>,
    ) -> Self {
        Self {
            settings,
            transport,
            kernel,
            publisher,
            looper,
            phases: PhaseTracker::new(),
        }
    }

    /// Run all steps once. With [`LoopPolicy::Forever`] this only returns on
    /// idle, setup failure or an aborted claim; the loop itself never ends.
    pub fn run<C>(
        mut self,
        collaborators: &mut C,
        policy: LoopPolicy,
    ) -> Result<BootReport, BootstrapError>
    where
        C: Collaborators + ?Sized,
    {
        let mut failures = Vec::new();

        self.phases.advance(BootstrapPhase::ConfigureThreadPool)?;
        self.transport.configure_threadpool(self.settings.threadpool);

        self.phases.advance(BootstrapPhase::InstantiateRegistry)?;
        let registry = collaborators.registry();
        let ctx = ProcessContext::new(Rc::clone(&registry));

        self.phases.advance(BootstrapPhase::RegisterRegistry)?;
        let as_service = Rc::clone(&registry).as_interface();
        self.register_chain(&registry, as_service, Owner::Manager, &mut failures);

        self.phases.advance(BootstrapPhase::InstantiateTokenManager)?;
        let token_manager = collaborators.token_manager();
        ctx.attach_token_manager(Rc::clone(&token_manager))?;

        self.phases.advance(BootstrapPhase::RegisterTokenManager)?;
        self.register_chain(&registry, token_manager, Owner::TokenManager, &mut failures);

        self.phases.advance(BootstrapPhase::AcquireDescriptor)?;
        let raw = self.transport.setup_polling();
        let Some(fd) = PollableDescriptor::from_raw(raw) else {
            let idle = LivenessGuard::engage(IdleReason::DescriptorUnavailable { raw });
            return Ok(BootReport {
                phases: self.phases.completed().to_vec(),
                registration_failures: failures,
                claim: None,
                readiness: ctx.readiness().state(),
                terminal: Terminal::Idle(idle),
                context: ctx,
            });
        };
        ctx.attach_descriptor(fd)?;

        self.phases.advance(BootstrapPhase::RegisterDescriptor)?;
        let pump = BinderCallback::new(Rc::clone(&self.transport));
        self.looper
            .add_fd(fd.raw(), EventMask::INPUT, Box::new(pump))
            .map_err(|err| {
                log::error!("[boot] failed to add binder FD to looper: {err}");
                BootstrapError::Setup(err)
            })?;

        self.phases.advance(BootstrapPhase::ClaimContextManager)?;
        let target = Rc::new(ManagerStub::new(Rc::clone(&registry)));
        let outcome = ContextManagerClaim::new()
            .install_dispatch_target(&*self.transport, target, &ctx)
            .and_then(|installed| installed.claim(&self.kernel, fd, &ctx))
            .map_err(BootstrapError::Claim)?;
        if let ClaimOutcome::Rejected(err) = &outcome {
            if self.settings.on_claim_failure == ClaimFailurePolicy::Abort {
                return Err(BootstrapError::ClaimRejected(err.clone()));
            }
            log::warn!("[boot] continuing without the context-manager role");
        }

        self.phases.advance(BootstrapPhase::PublishReadiness)?;
        let key = &self.settings.ready_key;
        let published =
            ctx.readiness()
                .publish_once(&*self.publisher, key, &self.settings.ready_value);
        if let Err(err) = published {
            log::error!("[boot] failed to set \"{key}\" ({err}); HAL services will not launch!");
        }

        self.phases.advance(BootstrapPhase::EnterLoop)?;
        log::info!("[boot] hwservicemanager is ready now");
        let iterations = self.looper.run(policy).map_err(|err| {
            log::error!("[boot] event loop stopped: {err}");
            BootstrapError::Loop(err)
        })?;

        Ok(BootReport {
            phases: self.phases.completed().to_vec(),
            registration_failures: failures,
            claim: Some(outcome),
            readiness: ctx.readiness().state(),
            terminal: Terminal::LoopEnded { iterations },
            context: ctx,
        })
    }

    fn register_chain(
        &self,
        registry: &Rc<dyn RegistryService>,
        service: Rc<dyn HidlInterface>,
        owner: Owner,
        failures: &mut Vec<RegistrationFailure>,
    ) {
        let instance = self.settings.instance.as_str();
        let chain = service.interface_chain();
        for interface in chain.iter() {
            if registry.add(interface, instance, Rc::clone(&service)) {
                log::debug!("[boot] registered {interface}/{instance}");
                continue;
            }
            let who = match owner {
                Owner::Manager => "hwservicemanager with itself",
                Owner::TokenManager => "ITokenManager with hwservicemanager",
            };
            log::error!("[boot] failed to register {who} as {interface}/{instance}");
            failures.push(RegistrationFailure {
                owner,
                interface: interface.to_owned(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_enforces_order() {
        let mut tracker = PhaseTracker::new();
        tracker.advance(BootstrapPhase::ConfigureThreadPool).unwrap();
        let err = tracker
            .advance(BootstrapPhase::RegisterRegistry)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "bootstrap phase order violation: expected InstantiateRegistry, saw RegisterRegistry"
        );
        assert_eq!(tracker.completed(), &[BootstrapPhase::ConfigureThreadPool]);
    }

    #[test]
    fn tracker_rejects_reentry_after_completion() {
        let mut tracker = PhaseTracker::new();
        for phase in ORDERING {
            tracker.advance(*phase).unwrap();
        }
        assert!(matches!(
            tracker.advance(BootstrapPhase::EnterLoop),
            Err(BootstrapError::Phase {
                expected: "completion",
                ..
            })
        ));
    }

    #[test]
    fn only_setup_failure_maps_to_255() {
        let setup = BootstrapError::Setup(LooperError::InvalidDescriptor(-1));
        assert_eq!(setup.exit_status(), 255);
        let claim = BootstrapError::ClaimRejected(ClaimError::Rejected { errno: 16 });
        assert_eq!(claim.exit_status(), 1);
    }

    #[test]
    fn settings_follow_config() {
        let mut config = Config::default();
        config.registry.instance = "default".into();
        config.transport.max_threads = 3;
        let settings = BootSettings::from_config(&config);
        assert_eq!(settings.instance, "default");
        assert_eq!(settings.threadpool.spawnable(), 2);
        assert_eq!(BootSettings::from_config(&Config::default()), BootSettings::default());
    }
}
