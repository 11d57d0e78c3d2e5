// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive the full bootstrap over the loopback transport and a real epoll looper.
// Author: Lukas Bower
#![cfg(any(target_os = "linux", target_os = "android"))]

use std::fs;
use std::rc::Rc;
use std::time::Duration;

use hidl_registry::codes;
use hidl_registry::manager::MANAGER_DESCRIPTOR;
use hidl_registry::token::TOKEN_MANAGER_DESCRIPTOR;
use hwservicemanager::loopback::{LoopbackKernel, LoopbackTransport};
use hwservicemanager::looper::EpollBackend;
use hwservicemanager::readiness::FilePublisher;
use hwservicemanager::stub::decode_strings;
use hwservicemanager::transport::{
    IpcTransport, STATUS_DEAD_OBJECT, STATUS_UNKNOWN_TRANSACTION,
};
use hwservicemanager::{
    BootSettings, Bootstrap, ClaimOutcome, DefaultCollaborators, LoopPolicy, Looper,
    ReadinessState, Terminal,
};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn serves_ibase_calls_after_bootstrap() {
    let (transport, injector) = LoopbackTransport::new().unwrap();
    let transport = Rc::new(transport);
    let kernel = Rc::new(LoopbackKernel::new());
    let dir = tempfile::tempdir().unwrap();
    let props = dir.path().join("props");

    // Queued before bootstrap; the first wait wakes on it.
    injector
        .send_transaction(codes::INTERFACE_CHAIN, &[], false)
        .unwrap();
    injector.send_transaction(codes::PING, &[], true).unwrap();
    injector.send_transaction(0x00ab_cdef, &[], false).unwrap();

    let mut collaborators = DefaultCollaborators::new();
    let report = Bootstrap::new(
        BootSettings::default(),
        Rc::clone(&transport),
        Rc::clone(&kernel),
        Box::new(FilePublisher::new(&props)),
        Looper::new(EpollBackend::new()),
    )
    .run(&mut collaborators, LoopPolicy::Iterations(1))
    .unwrap();

    assert_eq!(report.claim, Some(ClaimOutcome::Claimed));
    assert_eq!(report.readiness, ReadinessState::Published);
    assert!(matches!(report.terminal, Terminal::LoopEnded { iterations: 1 }));
    assert_eq!(kernel.claims(), 1);
    assert_eq!(kernel.owner(), report.context.descriptor());
    assert_eq!(
        fs::read_to_string(&props).unwrap(),
        "hwservicemanager.ready=true\n"
    );

    let chain = injector.recv_reply(REPLY_TIMEOUT).unwrap();
    assert_eq!(chain.status, 0);
    assert_eq!(
        decode_strings(&chain.payload).unwrap(),
        vec![
            MANAGER_DESCRIPTOR.to_owned(),
            "android.hidl.base@1.0::IBase".to_owned(),
        ]
    );
    // The one-way ping produced no reply; the next frame answers the unknown code.
    let unknown = injector.recv_reply(REPLY_TIMEOUT).unwrap();
    assert_eq!(unknown.status, STATUS_UNKNOWN_TRANSACTION);

    let registry = collaborators.service_manager().unwrap();
    let names: Vec<String> = registry
        .registrations()
        .into_iter()
        .map(|reg| reg.interface.to_string())
        .collect();
    assert!(names.contains(&MANAGER_DESCRIPTOR.to_owned()));
    assert!(names.contains(&TOKEN_MANAGER_DESCRIPTOR.to_owned()));
    assert_eq!(registry.len(), 3);
}

#[test]
fn second_instance_loses_the_claim_but_keeps_serving() {
    let (transport, injector) = LoopbackTransport::new().unwrap();
    let transport = Rc::new(transport);
    injector.send_transaction(codes::PING, &[], false).unwrap();

    let mut collaborators = DefaultCollaborators::new();
    let report = Bootstrap::new(
        BootSettings::default(),
        Rc::clone(&transport),
        LoopbackKernel::already_claimed(),
        Box::new(hwservicemanager::readiness::NullPublisher),
        Looper::new(EpollBackend::new()),
    )
    .run(&mut collaborators, LoopPolicy::Iterations(1))
    .unwrap();

    assert!(matches!(report.claim, Some(ClaimOutcome::Rejected(_))));
    assert_eq!(report.readiness, ReadinessState::Published);
    let ping = injector.recv_reply(REPLY_TIMEOUT).unwrap();
    assert_eq!(ping.status, 0);
    assert!(ping.payload.is_empty());
}

#[test]
fn transactions_before_installation_are_answered_dead() {
    let (transport, injector) = LoopbackTransport::new().unwrap();
    assert!(transport.setup_polling() >= 0);
    injector.send_transaction(codes::PING, &[], false).unwrap();
    injector.send_noop().unwrap();
    injector.send_spawn_looper().unwrap();

    let stats = transport.handle_polled_commands().unwrap();
    assert_eq!(stats.commands, 3);
    assert_eq!(stats.unroutable, 1);
    assert_eq!(stats.transactions, 0);

    let reply = injector.recv_reply(REPLY_TIMEOUT).unwrap();
    assert_eq!(reply.status, STATUS_DEAD_OBJECT);
}

#[test]
fn malformed_frame_is_a_protocol_error() {
    let (transport, injector) = LoopbackTransport::new().unwrap();
    transport.setup_polling();
    injector.send_raw(&[1, 2]).unwrap();
    assert!(transport.handle_polled_commands().is_err());
    // Nothing left queued.
    assert_eq!(transport.handle_polled_commands().unwrap().commands, 0);
}
