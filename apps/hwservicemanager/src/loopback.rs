// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: In-process datagram transport standing in for the hwbinder driver.
// Author: Lukas Bower

//! Loopback transport over a Unix datagram socket pair.
//!
//! The service end is non-blocking and is what the looper watches. The
//! [`LoopbackInjector`] end plays the kernel: it writes command frames and
//! reads replies.
//!
//! Command frame: `[kind u8][code u32 LE][flags u32 LE][payload]`.
//! Reply frame: `[status i32 LE][payload]`, sent for two-way transactions only.

use core::cell::Cell;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::rc::Rc;
use std::time::Duration;

use crate::claim::ClaimError;
use crate::transport::{
    ContextSlot, DispatchTarget, DrainStats, IpcTransport, KernelControl, PollableDescriptor,
    Routed, ThreadPoolConfig, Transaction, TransportError, STATUS_DEAD_OBJECT,
};

/// Frame kind: wake-up with no work.
pub const FRAME_NOOP: u8 = 0;
/// Frame kind: inbound transaction.
pub const FRAME_TRANSACTION: u8 = 1;
/// Frame kind: request to spawn another dispatch thread.
pub const FRAME_SPAWN_LOOPER: u8 = 2;
/// Flags bit: caller does not wait for a reply.
pub const FLAG_ONE_WAY: u32 = 0x01;

const HEADER_LEN: usize = 9;
const MAX_FRAME: usize = 64 * 1024;

/// Decoded command frame.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Noop,
    Transaction(Transaction),
    SpawnLooper,
}

fn encode_frame(kind: u8, code: u32, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(kind);
    frame.extend_from_slice(&code.to_le_bytes());
    frame.extend_from_slice(&flags.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn decode_frame(frame: &[u8]) -> Result<Command, TransportError> {
    let Some((header, payload)) = frame.split_first_chunk::<HEADER_LEN>() else {
        return Err(TransportError::Protocol(format!(
            "short frame ({} bytes)",
            frame.len()
        )));
    };
    let [kind, c0, c1, c2, c3, f0, f1, f2, f3] = *header;
    let code = u32::from_le_bytes([c0, c1, c2, c3]);
    let flags = u32::from_le_bytes([f0, f1, f2, f3]);
    match kind {
        FRAME_NOOP => Ok(Command::Noop),
        FRAME_SPAWN_LOOPER => Ok(Command::SpawnLooper),
        FRAME_TRANSACTION => Ok(Command::Transaction(Transaction {
            code,
            one_way: flags & FLAG_ONE_WAY != 0,
            data: payload.to_vec(),
        })),
        other => Err(TransportError::Protocol(format!(
            "unknown frame kind {other}"
        ))),
    }
}

fn encode_reply(status: i32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&status.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Service end of the loopback pair.
pub struct LoopbackTransport {
    socket: UnixDatagram,
    threadpool: Cell<Option<ThreadPoolConfig>>,
    polling: Cell<bool>,
    context: ContextSlot,
}

impl LoopbackTransport {
    /// Create a connected pair.
    pub fn new() -> io::Result<(Self, LoopbackInjector)> {
        let (service, peer) = UnixDatagram::pair()?;
        service.set_nonblocking(true)?;
        let transport = Self {
            socket: service,
            threadpool: Cell::new(None),
            polling: Cell::new(false),
            context: ContextSlot::default(),
        };
        Ok((transport, LoopbackInjector { socket: peer }))
    }

    /// Thread-pool shape last configured.
    #[must_use]
    pub fn threadpool(&self) -> Option<ThreadPoolConfig> {
        self.threadpool.get()
    }

    fn reply(&self, status: i32, payload: &[u8]) -> Result<(), TransportError> {
        self.socket
            .send(&encode_reply(status, payload))
            .map(drop)
            .map_err(|err| TransportError::io("loopback send", err))
    }
}

impl IpcTransport for LoopbackTransport {
    fn configure_threadpool(&self, config: ThreadPoolConfig) {
        log::debug!(
            "[loopback] threadpool max={} join={}",
            config.max_threads,
            config.caller_will_join
        );
        self.threadpool.set(Some(config));
    }

    fn setup_polling(&self) -> RawFd {
        self.polling.set(true);
        self.socket.as_raw_fd()
    }

    fn set_context_object(&self, target: Rc<dyn DispatchTarget>) {
        self.context.install(target);
    }

    fn has_context_object(&self) -> bool {
        self.context.is_installed()
    }

    fn handle_polled_commands(&self) -> Result<DrainStats, TransportError> {
        if !self.polling.get() {
            return Err(TransportError::NotPolling);
        }
        let mut stats = DrainStats::default();
        let mut buf = vec![0u8; MAX_FRAME];
        loop {
            let len = match self.socket.recv(&mut buf) {
                Ok(len) => len,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::io("loopback recv", err)),
            };
            stats.commands += 1;
            match decode_frame(&buf[..len])? {
                Command::Noop => {}
                Command::SpawnLooper => {
                    let spawnable = self.threadpool.get().unwrap_or_default().spawnable();
                    log::debug!("[loopback] spawn request ignored (spawnable={spawnable})");
                }
                Command::Transaction(txn) => {
                    let routed = self.context.route(&txn, &mut stats);
                    if txn.one_way {
                        continue;
                    }
                    match routed {
                        Routed::Reply(payload) => self.reply(0, &payload)?,
                        Routed::Failed(err) => self.reply(err.status(), &[])?,
                        Routed::Unroutable => self.reply(STATUS_DEAD_OBJECT, &[])?,
                    }
                }
            }
        }
        Ok(stats)
    }
}

/// Peer end of the loopback pair, acting as the driver.
#[derive(Debug)]
pub struct LoopbackInjector {
    socket: UnixDatagram,
}

/// Reply frame received by the injector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopbackReply {
    /// Status code; zero on success.
    pub status: i32,
    /// Reply payload.
    pub payload: Vec<u8>,
}

impl LoopbackInjector {
    /// Queue a wake-up carrying no work.
    pub fn send_noop(&self) -> io::Result<()> {
        self.socket
            .send(&encode_frame(FRAME_NOOP, 0, 0, &[]))
            .map(drop)
    }

    /// Queue a spawn-looper request.
    pub fn send_spawn_looper(&self) -> io::Result<()> {
        self.socket
            .send(&encode_frame(FRAME_SPAWN_LOOPER, 0, 0, &[]))
            .map(drop)
    }

    /// Queue a transaction for the context object.
    pub fn send_transaction(&self, code: u32, data: &[u8], one_way: bool) -> io::Result<()> {
        let flags = if one_way { FLAG_ONE_WAY } else { 0 };
        self.socket
            .send(&encode_frame(FRAME_TRANSACTION, code, flags, data))
            .map(drop)
    }

    /// Queue raw bytes, bypassing frame encoding.
    pub fn send_raw(&self, frame: &[u8]) -> io::Result<()> {
        self.socket.send(frame).map(drop)
    }

    /// Wait up to `timeout` for a reply frame.
    pub fn recv_reply(&self, timeout: Duration) -> io::Result<LoopbackReply> {
        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = vec![0u8; MAX_FRAME];
        let len = self.socket.recv(&mut buf)?;
        let Some((status, payload)) = buf[..len].split_first_chunk::<4>() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("short reply ({len} bytes)"),
            ));
        };
        Ok(LoopbackReply {
            status: i32::from_le_bytes(*status),
            payload: payload.to_vec(),
        })
    }
}

/// Kernel control for the loopback transport: one claim per instance.
#[derive(Debug, Default)]
pub struct LoopbackKernel {
    owner: Cell<Option<PollableDescriptor>>,
    held_elsewhere: bool,
    attempts: Cell<usize>,
}

impl LoopbackKernel {
    /// Unclaimed kernel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel whose context-manager role is held by another process.
    #[must_use]
    pub fn already_claimed() -> Self {
        Self {
            held_elsewhere: true,
            ..Self::default()
        }
    }

    /// Claim attempts seen.
    #[must_use]
    pub fn claims(&self) -> usize {
        self.attempts.get()
    }

    /// Descriptor holding the role, if this process won it.
    #[must_use]
    pub fn owner(&self) -> Option<PollableDescriptor> {
        self.owner.get()
    }
}

impl KernelControl for LoopbackKernel {
    fn claim_singleton_role(&self, fd: PollableDescriptor) -> Result<(), ClaimError> {
        self.attempts.set(self.attempts.get() + 1);
        if self.held_elsewhere || self.owner.get().is_some() {
            return Err(ClaimError::Rejected { errno: libc::EBUSY });
        }
        self.owner.set(Some(fd));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_decoding() {
        let frame = encode_frame(FRAME_TRANSACTION, 0x0f504e47, FLAG_ONE_WAY, b"abc");
        assert_eq!(
            decode_frame(&frame).unwrap(),
            Command::Transaction(Transaction {
                code: 0x0f504e47,
                one_way: true,
                data: b"abc".to_vec(),
            })
        );
        assert!(matches!(
            decode_frame(&[FRAME_NOOP, 0, 0]),
            Err(TransportError::Protocol(_))
        ));
        assert!(matches!(
            decode_frame(&encode_frame(9, 0, 0, &[])),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn drain_requires_polling() {
        let (transport, _injector) = LoopbackTransport::new().unwrap();
        assert!(matches!(
            transport.handle_polled_commands(),
            Err(TransportError::NotPolling)
        ));
    }

    #[test]
    fn kernel_grants_role_once() {
        let kernel = LoopbackKernel::new();
        let fd = PollableDescriptor::from_raw(5).unwrap();
        kernel.claim_singleton_role(fd).unwrap();
        assert_eq!(
            kernel.claim_singleton_role(fd),
            Err(ClaimError::Rejected { errno: libc::EBUSY })
        );
        assert_eq!(kernel.claims(), 2);
        assert_eq!(kernel.owner(), Some(fd));

        let busy = LoopbackKernel::already_claimed();
        assert!(busy.claim_singleton_role(fd).is_err());
    }
}
