// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Service registry collaborator backing the hwservicemanager core.
// Author: Lukas Bower

//! Service registry keyed by `(interface, instance)`.
//!
//! The registry only accepts registrations; lookups, death notifications and
//! client discovery live elsewhere. Everything here runs on the single
//! dispatch thread, so interior mutability is a plain `RefCell`.

use core::cell::RefCell;
use core::fmt;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::{FqName, InterfaceChain, IBASE_DESCRIPTOR};

/// Descriptor of the registry interface.
pub const MANAGER_DESCRIPTOR: &str = "android.hidl.manager@1.0::IServiceManager";

/// Object that reports a HIDL interface chain.
pub trait HidlInterface {
    /// Ordered chain, most-derived first.
    fn interface_chain(&self) -> InterfaceChain;

    /// Most-derived interface of [`Self::interface_chain`].
    fn descriptor(&self) -> String {
        self.interface_chain().descriptor().to_owned()
    }
}

/// Registry operations consumed by the bootstrap sequencer.
pub trait RegistryService: HidlInterface {
    /// Register `service` as `instance` of `interface`. Returns `false` when
    /// the registration was refused.
    fn add(&self, interface: &str, instance: &str, service: Rc<dyn HidlInterface>) -> bool;

    /// Upcast to the plain interface view so the registry can register itself.
    fn as_interface(self: Rc<Self>) -> Rc<dyn HidlInterface>;
}

/// Diagnostic view of one registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationInfo {
    /// Interface the service was registered under.
    pub interface: FqName,
    /// Instance name, e.g. `manager` or `default`.
    pub instance: String,
    /// Most-derived descriptor reported by the registered object.
    pub descriptor: String,
}

struct Registration {
    descriptor: String,
    // Held for the life of the registry.
    _service: Rc<dyn HidlInterface>,
}

/// In-process registry of HIDL services.
#[derive(Default)]
pub struct ServiceManager {
    entries: RefCell<BTreeMap<(FqName, String), Registration>>,
}

impl ServiceManager {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all registrations in key order.
    #[must_use]
    pub fn registrations(&self) -> Vec<RegistrationInfo> {
        self.entries
            .borrow()
            .iter()
            .map(|((interface, instance), reg)| RegistrationInfo {
                interface: interface.clone(),
                instance: instance.clone(),
                descriptor: reg.descriptor.clone(),
            })
            .collect()
    }

    /// Number of registrations held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Return `true` when nothing has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceManager")
            .field("registrations", &self.len())
            .finish()
    }
}

impl HidlInterface for ServiceManager {
    fn interface_chain(&self) -> InterfaceChain {
        builtin_chain(MANAGER_DESCRIPTOR)
    }
}

impl RegistryService for ServiceManager {
    fn add(&self, interface: &str, instance: &str, service: Rc<dyn HidlInterface>) -> bool {
        if instance.trim().is_empty() {
            log::warn!("[registry] refused {interface}: empty instance name");
            return false;
        }
        let fq_name = match FqName::parse(interface) {
            Ok(name) => name,
            Err(err) => {
                log::warn!("[registry] refused {interface}/{instance}: {err}");
                return false;
            }
        };
        let chain = service.interface_chain();
        if !chain.contains(interface) {
            log::warn!(
                "[registry] refused {interface}/{instance}: not in service chain ({chain})"
            );
            return false;
        }

        let key = (fq_name, instance.to_owned());
        let replaced = self
            .entries
            .borrow_mut()
            .insert(
                key,
                Registration {
                    descriptor: chain.descriptor().to_owned(),
                    _service: service,
                },
            )
            .is_some();
        if replaced {
            log::info!("[registry] replaced {interface}/{instance}");
        } else {
            log::debug!("[registry] added {interface}/{instance}");
        }
        true
    }

    fn as_interface(self: Rc<Self>) -> Rc<dyn HidlInterface> {
        self
    }
}

/// Chain of a built-in collaborator: its own descriptor followed by IBase.
pub(crate) fn builtin_chain(descriptor: &'static str) -> InterfaceChain {
    InterfaceChain::new(descriptor, [IBASE_DESCRIPTOR])
}
