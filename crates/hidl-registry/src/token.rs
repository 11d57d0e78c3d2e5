// Author: Lukas Bower
//! Token manager collaborator published alongside the registry.

use crate::manager::{builtin_chain, HidlInterface};
use crate::InterfaceChain;

/// Descriptor of the token manager interface.
pub const TOKEN_MANAGER_DESCRIPTOR: &str = "android.hidl.token@1.0::ITokenManager";

/// Token manager object. Token lifecycle is owned elsewhere; the bootstrap
/// only needs its interface chain to publish it inside the registry.
#[derive(Debug, Default)]
pub struct TokenManager;

impl TokenManager {
    /// Construct the token manager.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HidlInterface for TokenManager {
    fn interface_chain(&self) -> InterfaceChain {
        builtin_chain(TOKEN_MANAGER_DESCRIPTOR)
    }
}
