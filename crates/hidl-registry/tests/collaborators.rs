// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate registry and token collaborators as the bootstrap consumes them.
// Author: Lukas Bower

use std::rc::Rc;

use hidl_registry::token::TOKEN_MANAGER_DESCRIPTOR;
use hidl_registry::{HidlInterface, RegistryService, ServiceManager, TokenManager, IBASE_DESCRIPTOR};

fn register_all(manager: &ServiceManager, service: Rc<dyn HidlInterface>) -> Vec<bool> {
    service
        .interface_chain()
        .iter()
        .map(|interface| manager.add(interface, "manager", Rc::clone(&service)))
        .collect()
}

#[test]
fn token_manager_chain_lands_in_manager_registry() {
    let manager = Rc::new(ServiceManager::new());
    let tokens = Rc::new(TokenManager::new());

    assert_eq!(tokens.descriptor(), TOKEN_MANAGER_DESCRIPTOR);
    assert_eq!(register_all(&manager, tokens), vec![true, true]);

    let names: Vec<String> = manager
        .registrations()
        .into_iter()
        .map(|reg| format!("{}/{}", reg.interface, reg.instance))
        .collect();
    assert_eq!(
        names,
        vec![
            format!("{IBASE_DESCRIPTOR}/manager"),
            format!("{TOKEN_MANAGER_DESCRIPTOR}/manager"),
        ]
    );
}

#[test]
fn ibase_registration_follows_latest_owner() {
    let manager = Rc::new(ServiceManager::new());
    let as_service = Rc::clone(&manager).as_interface();
    assert_eq!(register_all(&manager, as_service), vec![true, true]);
    assert_eq!(register_all(&manager, Rc::new(TokenManager::new())), vec![true, true]);

    // IServiceManager, ITokenManager, and a single shared IBase slot.
    assert_eq!(manager.len(), 3);
    let ibase = manager
        .registrations()
        .into_iter()
        .find(|reg| reg.interface.to_string() == IBASE_DESCRIPTOR)
        .expect("IBase registered");
    assert_eq!(ibase.descriptor, TOKEN_MANAGER_DESCRIPTOR);
}
