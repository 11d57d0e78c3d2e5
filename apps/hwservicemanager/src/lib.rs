// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Crate root for the hwservicemanager bootstrap and event-loop core.
// Author: Lukas Bower
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Bootstrap, context-manager claim and event loop of the HIDL service
//! manager.
//!
//! The binary wires these pieces together; the library keeps every external
//! effect (transport, kernel claim, readiness property, poll backend) behind
//! a trait so the sequence can run against fakes.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod binder;
pub mod bootstrap;
pub mod claim;
pub mod config;
pub mod context;
pub mod guard;
pub mod loopback;
pub mod looper;
pub mod pump;
pub mod readiness;
pub mod stub;
pub mod transport;

pub use bootstrap::{
    BootReport, BootSettings, Bootstrap, BootstrapError, BootstrapPhase, Collaborators,
    DefaultCollaborators, Owner, RegistrationFailure, Terminal,
};
pub use claim::{ClaimError, ClaimOutcome, ClaimState, ContextManagerClaim};
pub use config::Config;
pub use context::ProcessContext;
pub use guard::{IdleReason, IdleState, LivenessGuard};
pub use looper::{CallbackAction, EventMask, LoopPolicy, Looper, LooperCallback, PollBackend};
pub use readiness::{ReadinessFlag, ReadinessPublisher, ReadinessState};
pub use transport::{DispatchTarget, IpcTransport, KernelControl, PollableDescriptor};
