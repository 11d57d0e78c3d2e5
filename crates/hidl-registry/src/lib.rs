// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Crate root for the HIDL registry collaborators.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Registry collaborators consumed by the hwservicemanager bootstrap.
//!
//! The crate provides the service registry (`ServiceManager`) that the
//! bootstrap registers itself into, the token manager it publishes next to
//! it, and the interface-chain types both share. Lookup and death tracking
//! are deliberately absent; callers only ever `add` and query chains.

pub mod chain;
pub mod codes;
pub mod fqname;
pub mod manager;
pub mod token;

pub use chain::InterfaceChain;
pub use fqname::FqName;
pub use manager::{HidlInterface, RegistrationInfo, RegistryService, ServiceManager};
pub use token::TokenManager;

use thiserror::Error;

/// Descriptor of the root interface every HIDL object derives from.
pub const IBASE_DESCRIPTOR: &str = "android.hidl.base@1.0::IBase";

/// Errors raised while building registry identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The supplied name is not a `package@major.minor::Interface` string.
    #[error("invalid fully-qualified interface name '{name}': {reason}")]
    InvalidFqName {
        /// Offending input.
        name: String,
        /// Which part failed to parse.
        reason: &'static str,
    },
    /// Interface chains must name at least the most-derived interface.
    #[error("interface chain is empty")]
    EmptyChain,
}
