// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: hwbinder driver transport using the kernel binder ioctl protocol.
// Author: Lukas Bower
#![allow(unsafe_code)]

//! Transport and kernel control backed by `/dev/hwbinder`.
//!
//! Only the subset of the binder protocol a single-threaded context manager
//! needs is spoken here: entering the looper, receiving transactions,
//! replying, freeing buffers and acknowledging reference counts.

use core::cell::{Cell, RefCell};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::rc::Rc;

use thiserror::Error;

use crate::claim::ClaimError;
use crate::transport::{
    ContextSlot, DispatchTarget, DrainStats, IpcTransport, KernelControl, PollableDescriptor,
    Routed, ThreadPoolConfig, Transaction, TransportError, STATUS_DEAD_OBJECT,
};

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

const TXN_DATA_LEN: usize = 64;
const PTR_COOKIE_LEN: usize = 16;

const BINDER_WRITE_READ: u32 = ioc(IOC_READ | IOC_WRITE, b'b', 1, 48);
const BINDER_SET_MAX_THREADS: u32 = ioc(IOC_WRITE, b'b', 5, 4);
const BINDER_SET_CONTEXT_MGR: u32 = ioc(IOC_WRITE, b'b', 7, 4);
const BINDER_VERSION: u32 = ioc(IOC_READ | IOC_WRITE, b'b', 9, 4);

/// Protocol revision this transport speaks.
pub const BINDER_CURRENT_PROTOCOL_VERSION: i32 = 8;

const BR_ERROR: u32 = ioc(IOC_READ, b'r', 0, 4);
const BR_OK: u32 = ioc(IOC_NONE, b'r', 1, 0);
const BR_TRANSACTION: u32 = ioc(IOC_READ, b'r', 2, TXN_DATA_LEN);
const BR_REPLY: u32 = ioc(IOC_READ, b'r', 3, TXN_DATA_LEN);
const BR_DEAD_REPLY: u32 = ioc(IOC_NONE, b'r', 5, 0);
const BR_TRANSACTION_COMPLETE: u32 = ioc(IOC_NONE, b'r', 6, 0);
const BR_INCREFS: u32 = ioc(IOC_READ, b'r', 7, PTR_COOKIE_LEN);
const BR_ACQUIRE: u32 = ioc(IOC_READ, b'r', 8, PTR_COOKIE_LEN);
const BR_RELEASE: u32 = ioc(IOC_READ, b'r', 9, PTR_COOKIE_LEN);
const BR_DECREFS: u32 = ioc(IOC_READ, b'r', 10, PTR_COOKIE_LEN);
const BR_NOOP: u32 = ioc(IOC_NONE, b'r', 12, 0);
const BR_SPAWN_LOOPER: u32 = ioc(IOC_NONE, b'r', 13, 0);
const BR_FINISHED: u32 = ioc(IOC_NONE, b'r', 14, 0);
const BR_DEAD_BINDER: u32 = ioc(IOC_READ, b'r', 15, 8);
const BR_CLEAR_DEATH_NOTIFICATION_DONE: u32 = ioc(IOC_READ, b'r', 16, 8);
const BR_FAILED_REPLY: u32 = ioc(IOC_NONE, b'r', 17, 0);

const BC_REPLY: u32 = ioc(IOC_WRITE, b'c', 1, TXN_DATA_LEN);
const BC_FREE_BUFFER: u32 = ioc(IOC_WRITE, b'c', 3, 8);
const BC_INCREFS_DONE: u32 = ioc(IOC_WRITE, b'c', 8, PTR_COOKIE_LEN);
const BC_ACQUIRE_DONE: u32 = ioc(IOC_WRITE, b'c', 9, PTR_COOKIE_LEN);
const BC_ENTER_LOOPER: u32 = ioc(IOC_NONE, b'c', 12, 0);

const TF_ONE_WAY: u32 = 0x01;
const TF_STATUS_CODE: u32 = 0x08;

const READ_BUFFER_WORDS: usize = 32;

/// Errors raised while opening the driver.
#[derive(Debug, Error)]
pub enum BinderOpenError {
    /// The device node could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        /// Device path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// A setup ioctl or the buffer mapping failed.
    #[error("{op} on {path} failed: {source}")]
    Setup {
        /// Device path.
        path: PathBuf,
        /// Operation that failed.
        op: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The driver speaks a different protocol revision.
    #[error("{path} speaks binder protocol {found}, expected {BINDER_CURRENT_PROTOCOL_VERSION}")]
    Version {
        /// Device path.
        path: PathBuf,
        /// Revision reported by the driver.
        found: i32,
    },
}

#[repr(C)]
#[derive(Debug, Default)]
struct BinderWriteRead {
    write_size: u64,
    write_consumed: u64,
    write_buffer: u64,
    read_size: u64,
    read_consumed: u64,
    read_buffer: u64,
}

/// `binder_transaction_data` on a 64-bit binder ABI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct TransactionData {
    target: u64,
    cookie: u64,
    code: u32,
    flags: u32,
    sender_pid: i32,
    sender_euid: u32,
    data_size: u64,
    offsets_size: u64,
    buffer: u64,
    offsets: u64,
}

impl TransactionData {
    fn decode(bytes: &[u8; TXN_DATA_LEN]) -> Self {
        let mut r = Reader::new(bytes);
        Self {
            target: r.u64(),
            cookie: r.u64(),
            code: r.u32(),
            flags: r.u32(),
            sender_pid: r.u32() as i32,
            sender_euid: r.u32(),
            data_size: r.u64(),
            offsets_size: r.u64(),
            buffer: r.u64(),
            offsets: r.u64(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.target.to_ne_bytes());
        out.extend_from_slice(&self.cookie.to_ne_bytes());
        out.extend_from_slice(&self.code.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
        out.extend_from_slice(&self.sender_pid.to_ne_bytes());
        out.extend_from_slice(&self.sender_euid.to_ne_bytes());
        out.extend_from_slice(&self.data_size.to_ne_bytes());
        out.extend_from_slice(&self.offsets_size.to_ne_bytes());
        out.extend_from_slice(&self.buffer.to_ne_bytes());
        out.extend_from_slice(&self.offsets.to_ne_bytes());
    }
}

/// Fixed-layout reader over an array the caller has already length-checked.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn u32(&mut self) -> u32 {
        let (head, rest) = self.bytes.split_at(4);
        self.bytes = rest;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(head);
        u32::from_ne_bytes(raw)
    }

    fn u64(&mut self) -> u64 {
        let (head, rest) = self.bytes.split_at(8);
        self.bytes = rest;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(head);
        u64::from_ne_bytes(raw)
    }
}

/// Cursor over the driver's return stream.
struct ReturnStream<'a> {
    bytes: &'a [u8],
}

impl<'a> ReturnStream<'a> {
    fn take<const N: usize>(&mut self, cmd: u32) -> Result<&'a [u8; N], TransportError> {
        let (head, rest) = self.bytes.split_first_chunk::<N>().ok_or_else(|| {
            TransportError::Protocol(format!("truncated payload for return {cmd:#010x}"))
        })?;
        self.bytes = rest;
        Ok(head)
    }

    fn next_cmd(&mut self) -> Result<Option<u32>, TransportError> {
        if self.bytes.is_empty() {
            return Ok(None);
        }
        let raw = self.take::<4>(0)?;
        Ok(Some(u32::from_ne_bytes(*raw)))
    }
}

/// Memory that transaction buffers handed out by the driver point into.
trait BufferArea {
    /// Borrow `len` bytes at driver address `addr`, or `None` when the range
    /// is not inside the area.
    fn slice(&self, addr: u64, len: u64) -> Option<&[u8]>;
}

/// Offset of `[addr, addr + len)` within `region_len` bytes starting at `base`.
fn offset_within(base: u64, region_len: usize, addr: u64, len: u64) -> Option<usize> {
    let end = base.checked_add(region_len as u64)?;
    let last = addr.checked_add(len)?;
    if addr < base || last > end {
        return None;
    }
    usize::try_from(addr - base).ok()
}

/// Read-only mapping of the driver's transaction buffer area.
struct Mapping {
    base: *mut libc::c_void,
    len: usize,
}

impl Mapping {
    fn new(fd: RawFd) -> io::Result<Self> {
        // SAFETY: sysconf has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page = usize::try_from(page).unwrap_or(4096);
        let len = (1024 * 1024) - 2 * page;
        // SAFETY: a fresh private read-only mapping of a descriptor we own;
        // the result is checked before use.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { base, len })
    }
}

impl BufferArea for Mapping {
    fn slice(&self, addr: u64, len: u64) -> Option<&[u8]> {
        if len == 0 {
            return Some(&[]);
        }
        let offset = offset_within(self.base as u64, self.len, addr, len)?;
        // SAFETY: the range was checked against the live mapping above and
        // the driver does not reuse a buffer until we free it.
        Some(unsafe {
            std::slice::from_raw_parts(self.base.cast::<u8>().add(offset), len as usize)
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` describe the mapping created in `new`.
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

/// Pending write-side commands plus the reply payloads they point into.
#[derive(Default)]
struct Outbox {
    bytes: Vec<u8>,
    payloads: Vec<Vec<u8>>,
}

impl Outbox {
    fn push_cmd(&mut self, cmd: u32) {
        self.bytes.extend_from_slice(&cmd.to_ne_bytes());
    }

    fn free_buffer(&mut self, buffer: u64) {
        self.push_cmd(BC_FREE_BUFFER);
        self.bytes.extend_from_slice(&buffer.to_ne_bytes());
    }

    fn ack_ref(&mut self, cmd: u32, ptr_cookie: &[u8; PTR_COOKIE_LEN]) {
        self.push_cmd(cmd);
        self.bytes.extend_from_slice(ptr_cookie);
    }

    fn reply(&mut self, status: i32, payload: &[u8]) {
        let mut data = Vec::with_capacity(4 + payload.len());
        data.extend_from_slice(&status.to_ne_bytes());
        data.extend_from_slice(payload);
        let flags = if status == 0 { 0 } else { TF_STATUS_CODE };
        let txn = TransactionData {
            flags,
            data_size: data.len() as u64,
            buffer: data.as_ptr() as u64,
            ..TransactionData::default()
        };
        self.push_cmd(BC_REPLY);
        txn.encode(&mut self.bytes);
        // The heap allocation does not move when the Vec itself moves.
        self.payloads.push(data);
    }

    fn consume(&mut self, consumed: usize) {
        let consumed = consumed.min(self.bytes.len());
        self.bytes.drain(..consumed);
        if self.bytes.is_empty() {
            self.payloads.clear();
        }
    }
}

/// Decode one batch of driver returns, queueing acknowledgements, replies
/// and buffer releases on `outbox`.
fn process_returns<A: BufferArea + ?Sized>(
    bytes: &[u8],
    area: &A,
    context: &ContextSlot,
    outbox: &mut Outbox,
    stats: &mut DrainStats,
) -> Result<(), TransportError> {
    let mut stream = ReturnStream { bytes };
    while let Some(cmd) = stream.next_cmd()? {
        stats.commands += 1;
        match cmd {
            BR_NOOP | BR_OK | BR_TRANSACTION_COMPLETE | BR_FINISHED | BR_DEAD_REPLY
            | BR_FAILED_REPLY => {}
            BR_SPAWN_LOOPER => log::debug!("[binder] spawn request ignored"),
            BR_ERROR => {
                let code = i32::from_ne_bytes(*stream.take::<4>(cmd)?);
                log::warn!("[binder] driver error {code}");
            }
            BR_INCREFS => outbox.ack_ref(BC_INCREFS_DONE, stream.take::<PTR_COOKIE_LEN>(cmd)?),
            BR_ACQUIRE => outbox.ack_ref(BC_ACQUIRE_DONE, stream.take::<PTR_COOKIE_LEN>(cmd)?),
            BR_RELEASE | BR_DECREFS => {
                stream.take::<PTR_COOKIE_LEN>(cmd)?;
            }
            BR_DEAD_BINDER | BR_CLEAR_DEATH_NOTIFICATION_DONE => {
                stream.take::<8>(cmd)?;
            }
            BR_REPLY => {
                let txn = TransactionData::decode(stream.take::<TXN_DATA_LEN>(cmd)?);
                outbox.free_buffer(txn.buffer);
            }
            BR_TRANSACTION => {
                let txn = TransactionData::decode(stream.take::<TXN_DATA_LEN>(cmd)?);
                deliver(&txn, area, context, outbox, stats)?;
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "unhandled return {other:#010x}"
                )))
            }
        }
    }
    Ok(())
}

fn deliver<A: BufferArea + ?Sized>(
    raw: &TransactionData,
    area: &A,
    context: &ContextSlot,
    outbox: &mut Outbox,
    stats: &mut DrainStats,
) -> Result<(), TransportError> {
    let data = area
        .slice(raw.buffer, raw.data_size)
        .ok_or_else(|| TransportError::Protocol("transaction buffer outside mapping".into()))?
        .to_vec();
    let txn = Transaction {
        code: raw.code,
        one_way: raw.flags & TF_ONE_WAY != 0,
        data,
    };
    log::trace!(
        "[binder] txn code={:#010x} from pid={} euid={}",
        txn.code,
        raw.sender_pid,
        raw.sender_euid
    );
    let routed = context.route(&txn, stats);
    if !txn.one_way {
        match routed {
            Routed::Reply(payload) => outbox.reply(0, &payload),
            Routed::Failed(err) => outbox.reply(err.status(), &[]),
            Routed::Unroutable => outbox.reply(STATUS_DEAD_OBJECT, &[]),
        }
    }
    outbox.free_buffer(raw.buffer);
    Ok(())
}

/// Next move of the drain loop after one `BINDER_WRITE_READ` round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Round {
    /// Decode this many returned bytes, then go again.
    Decode(usize),
    /// Nothing read but the driver took some writes; flush the rest.
    Flush,
    /// Drained. Unaccepted writes stay queued for the next wake.
    Done,
}

fn next_round(read: usize, write_consumed: u64, writes_pending: bool) -> Round {
    if read > 0 {
        Round::Decode(read)
    } else if writes_pending && write_consumed > 0 {
        Round::Flush
    } else {
        Round::Done
    }
}

/// An open binder device node.
pub struct BinderDevice {
    file: File,
    mapping: Mapping,
    polling: Cell<bool>,
    context: ContextSlot,
    outbox: RefCell<Outbox>,
}

impl BinderDevice {
    /// Open `path`, check the protocol revision and map the buffer area.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BinderOpenError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
            .open(&path)
            .map_err(|source| BinderOpenError::Open {
                path: path.clone(),
                source,
            })?;
        let setup_err = |op, source| BinderOpenError::Setup {
            path: path.clone(),
            op,
            source,
        };

        let mut version: i32 = 0;
        // SAFETY: BINDER_VERSION writes one i32 into `version`.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), BINDER_VERSION as _, &mut version) };
        if rc < 0 {
            return Err(setup_err("BINDER_VERSION", io::Error::last_os_error()));
        }
        if version != BINDER_CURRENT_PROTOCOL_VERSION {
            return Err(BinderOpenError::Version {
                path: path.clone(),
                found: version,
            });
        }

        let mapping =
            Mapping::new(file.as_raw_fd()).map_err(|source| setup_err("mmap", source))?;
        log::info!("[binder] opened {} (protocol {version})", path.display());
        Ok(Self {
            file,
            mapping,
            polling: Cell::new(false),
            context: ContextSlot::default(),
            outbox: RefCell::new(Outbox::default()),
        })
    }

    fn write_read(&self, bwr: &mut BinderWriteRead) -> io::Result<()> {
        loop {
            // SAFETY: `bwr` points at buffers that stay alive for the call.
            let rc = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    BINDER_WRITE_READ as _,
                    ptr::from_mut(bwr),
                )
            };
            if rc >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl IpcTransport for BinderDevice {
    fn configure_threadpool(&self, config: ThreadPoolConfig) {
        let mut spawnable = config.spawnable();
        // SAFETY: BINDER_SET_MAX_THREADS reads one u32.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                BINDER_SET_MAX_THREADS as _,
                &mut spawnable,
            )
        };
        if rc < 0 {
            log::warn!(
                "[binder] BINDER_SET_MAX_THREADS({spawnable}) failed: {}",
                io::Error::last_os_error()
            );
        }
    }

    fn setup_polling(&self) -> RawFd {
        let mut outbox = self.outbox.borrow_mut();
        outbox.push_cmd(BC_ENTER_LOOPER);
        let mut bwr = BinderWriteRead {
            write_size: outbox.bytes.len() as u64,
            write_buffer: outbox.bytes.as_ptr() as u64,
            ..BinderWriteRead::default()
        };
        if let Err(err) = self.write_read(&mut bwr) {
            log::error!("[binder] BC_ENTER_LOOPER failed: {err}");
            return -1;
        }
        outbox.consume(bwr.write_consumed as usize);
        self.polling.set(true);
        self.file.as_raw_fd()
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
        let mut outbox = self.outbox.borrow_mut();
        let mut read_buf = [0u64; READ_BUFFER_WORDS];
        loop {
            let mut bwr = BinderWriteRead {
                write_size: outbox.bytes.len() as u64,
                write_buffer: outbox.bytes.as_ptr() as u64,
                read_size: core::mem::size_of_val(&read_buf) as u64,
                read_buffer: read_buf.as_mut_ptr() as u64,
                ..BinderWriteRead::default()
            };
            let result = self.write_read(&mut bwr);
            // The driver reports progress even when the read half fails.
            outbox.consume(bwr.write_consumed as usize);
            let read = match result {
                Ok(()) => (bwr.read_consumed as usize).min(core::mem::size_of_val(&read_buf)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => 0,
                Err(err) => return Err(TransportError::io("BINDER_WRITE_READ", err)),
            };

            match next_round(read, bwr.write_consumed, !outbox.bytes.is_empty()) {
                Round::Decode(len) => {
                    let mut returned = Vec::with_capacity(len);
                    for word in &read_buf {
                        returned.extend_from_slice(&word.to_ne_bytes());
                    }
                    returned.truncate(len);
                    process_returns(
                        &returned,
                        &self.mapping,
                        &self.context,
                        &mut outbox,
                        &mut stats,
                    )?;
                }
                Round::Flush => {}
                Round::Done => {
                    if !outbox.bytes.is_empty() {
                        log::debug!(
                            "[binder] {} command bytes held for the next wake",
                            outbox.bytes.len()
                        );
                    }
                    break;
                }
            }
        }
        Ok(stats)
    }
}

impl KernelControl for BinderDevice {
    fn claim_singleton_role(&self, fd: PollableDescriptor) -> Result<(), ClaimError> {
        if fd.raw() != self.file.as_raw_fd() {
            return Err(ClaimError::InvalidDescriptor(fd.raw()));
        }
        let mut unused: i32 = 0;
        // SAFETY: BINDER_SET_CONTEXT_MGR reads one i32.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                BINDER_SET_CONTEXT_MGR as _,
                &mut unused,
            )
        };
        if rc < 0 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            return Err(ClaimError::Rejected { errno });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DispatchError, STATUS_UNKNOWN_TRANSACTION};

    #[test]
    fn request_codes_match_uapi() {
        assert_eq!(BINDER_WRITE_READ, 0xc030_6201);
        assert_eq!(BINDER_SET_MAX_THREADS, 0x4004_6205);
        assert_eq!(BINDER_SET_CONTEXT_MGR, 0x4004_6207);
        assert_eq!(BINDER_VERSION, 0xc004_6209);
        assert_eq!(BR_TRANSACTION, 0x8040_7202);
        assert_eq!(BR_NOOP, 0x0000_720c);
        assert_eq!(BC_REPLY, 0x4040_6301);
        assert_eq!(BC_FREE_BUFFER, 0x4008_6303);
        assert_eq!(BC_ENTER_LOOPER, 0x0000_630c);
    }

    #[test]
    fn transaction_data_layout() {
        let txn = TransactionData {
            target: 1,
            cookie: 2,
            code: 3,
            flags: TF_ONE_WAY,
            sender_pid: 42,
            sender_euid: 1000,
            data_size: 16,
            offsets_size: 0,
            buffer: 0xdead_0000,
            offsets: 0xdead_0010,
        };
        let mut bytes = Vec::new();
        txn.encode(&mut bytes);
        assert_eq!(bytes.len(), TXN_DATA_LEN);
        let fixed: &[u8; TXN_DATA_LEN] = bytes.as_slice().try_into().unwrap();
        assert_eq!(TransactionData::decode(fixed), txn);
    }

    #[test]
    fn outbox_reply_marks_status_codes() {
        let mut outbox = Outbox::default();
        outbox.reply(STATUS_DEAD_OBJECT, &[]);
        assert_eq!(outbox.bytes.len(), 4 + TXN_DATA_LEN);
        let (cmd, body) = outbox.bytes.split_first_chunk::<4>().unwrap();
        assert_eq!(u32::from_ne_bytes(*cmd), BC_REPLY);
        let txn = TransactionData::decode(body.try_into().unwrap());
        assert_eq!(txn.flags, TF_STATUS_CODE);
        assert_eq!(txn.data_size, 4);

        outbox.consume(outbox.bytes.len());
        assert!(outbox.payloads.is_empty());
    }

    #[test]
    fn missing_device_is_reported() {
        let err = BinderDevice::open("/nonexistent/hwbinder").err().unwrap();
        assert!(matches!(err, BinderOpenError::Open { .. }), "{err}");
    }

    const ARENA_BASE: u64 = 0x7000_0000;

    /// Buffer area backed by a heap vector at a made-up driver address.
    struct Arena {
        base: u64,
        bytes: Vec<u8>,
    }

    impl BufferArea for Arena {
        fn slice(&self, addr: u64, len: u64) -> Option<&[u8]> {
            let offset = offset_within(self.base, self.bytes.len(), addr, len)?;
            self.bytes.get(offset..offset + len as usize)
        }
    }

    /// Code 1 answers with the payload reversed; anything else is unknown.
    struct Reverse;

    impl DispatchTarget for Reverse {
        fn on_transaction(&self, txn: &Transaction) -> Result<Vec<u8>, DispatchError> {
            match txn.code {
                1 => Ok(txn.data.iter().rev().copied().collect()),
                other => Err(DispatchError::UnknownCode(other)),
            }
        }
    }

    fn br(stream: &mut Vec<u8>, cmd: u32, payload: &[u8]) {
        stream.extend_from_slice(&cmd.to_ne_bytes());
        stream.extend_from_slice(payload);
    }

    fn txn_body(code: u32, flags: u32, buffer: u64, data_size: u64) -> Vec<u8> {
        let mut body = Vec::new();
        TransactionData {
            code,
            flags,
            buffer,
            data_size,
            ..TransactionData::default()
        }
        .encode(&mut body);
        body
    }

    /// Split queued write commands into `(cmd, body)` pairs.
    fn written(outbox: &Outbox) -> Vec<(u32, Vec<u8>)> {
        let mut cmds = Vec::new();
        let mut rest = outbox.bytes.as_slice();
        while let Some((cmd, tail)) = rest.split_first_chunk::<4>() {
            let cmd = u32::from_ne_bytes(*cmd);
            let len = match cmd {
                BC_REPLY => TXN_DATA_LEN,
                BC_FREE_BUFFER => 8,
                BC_INCREFS_DONE | BC_ACQUIRE_DONE => PTR_COOKIE_LEN,
                _ => 0,
            };
            let (body, tail) = tail.split_at(len);
            cmds.push((cmd, body.to_vec()));
            rest = tail;
        }
        cmds
    }

    fn decode_reply(body: &[u8]) -> TransactionData {
        TransactionData::decode(body.try_into().unwrap())
    }

    fn process(
        stream: &[u8],
        context: &ContextSlot,
    ) -> (Result<(), TransportError>, Outbox, DrainStats) {
        let arena = Arena {
            base: ARENA_BASE,
            bytes: b"ping-payload".to_vec(),
        };
        let mut outbox = Outbox::default();
        let mut stats = DrainStats::default();
        let result = process_returns(stream, &arena, context, &mut outbox, &mut stats);
        (result, outbox, stats)
    }

    fn reverse_context() -> ContextSlot {
        let context = ContextSlot::default();
        context.install(Rc::new(Reverse));
        context
    }

    #[test]
    fn reference_counts_are_acknowledged() {
        let ptr_cookie: Vec<u8> = (1..=16).collect();
        let mut stream = Vec::new();
        br(&mut stream, BR_INCREFS, &ptr_cookie);
        br(&mut stream, BR_ACQUIRE, &ptr_cookie);
        br(&mut stream, BR_RELEASE, &ptr_cookie);
        br(&mut stream, BR_DECREFS, &ptr_cookie);
        br(&mut stream, BR_NOOP, &[]);
        br(&mut stream, BR_SPAWN_LOOPER, &[]);

        let (result, outbox, stats) = process(&stream, &ContextSlot::default());
        result.unwrap();
        assert_eq!(stats.commands, 6);
        assert_eq!(
            written(&outbox),
            vec![
                (BC_INCREFS_DONE, ptr_cookie.clone()),
                (BC_ACQUIRE_DONE, ptr_cookie),
            ]
        );
    }

    #[test]
    fn two_way_transaction_is_answered_then_freed() {
        let mut stream = Vec::new();
        br(&mut stream, BR_TRANSACTION, &txn_body(1, 0, ARENA_BASE, 4));

        let (result, outbox, stats) = process(&stream, &reverse_context());
        result.unwrap();
        assert_eq!(stats.transactions, 1);

        let cmds = written(&outbox);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].0, BC_REPLY);
        let reply = decode_reply(&cmds[0].1);
        assert_eq!(reply.flags, 0);
        let mut expected = 0i32.to_ne_bytes().to_vec();
        expected.extend_from_slice(b"gnip");
        assert_eq!(outbox.payloads, vec![expected]);
        assert_eq!(reply.data_size, 8);
        assert_eq!(reply.buffer, outbox.payloads[0].as_ptr() as u64);
        assert_eq!(cmds[1], (BC_FREE_BUFFER, ARENA_BASE.to_ne_bytes().to_vec()));
    }

    #[test]
    fn one_way_transaction_only_frees_its_buffer() {
        let mut stream = Vec::new();
        br(&mut stream, BR_TRANSACTION, &txn_body(1, TF_ONE_WAY, ARENA_BASE + 5, 7));

        let (result, outbox, stats) = process(&stream, &reverse_context());
        result.unwrap();
        assert_eq!(stats.transactions, 1);
        assert_eq!(
            written(&outbox),
            vec![(BC_FREE_BUFFER, (ARENA_BASE + 5).to_ne_bytes().to_vec())]
        );
        assert!(outbox.payloads.is_empty());
    }

    #[test]
    fn failed_and_unroutable_calls_reply_with_status_codes() {
        let mut stream = Vec::new();
        br(&mut stream, BR_TRANSACTION, &txn_body(9, 0, ARENA_BASE, 0));

        let (result, outbox, _) = process(&stream, &reverse_context());
        result.unwrap();
        let cmds = written(&outbox);
        assert_eq!(decode_reply(&cmds[0].1).flags, TF_STATUS_CODE);
        assert_eq!(
            outbox.payloads,
            vec![STATUS_UNKNOWN_TRANSACTION.to_ne_bytes().to_vec()]
        );
        assert_eq!(cmds[1].0, BC_FREE_BUFFER);

        let (result, outbox, stats) = process(&stream, &ContextSlot::default());
        result.unwrap();
        assert_eq!(stats.unroutable, 1);
        assert_eq!(stats.transactions, 0);
        assert_eq!(outbox.payloads, vec![STATUS_DEAD_OBJECT.to_ne_bytes().to_vec()]);
        assert_eq!(written(&outbox)[1].0, BC_FREE_BUFFER);
    }

    #[test]
    fn truncated_returns_are_protocol_errors() {
        let mut stream = Vec::new();
        br(&mut stream, BR_TRANSACTION, &txn_body(1, 0, ARENA_BASE, 4)[..40]);
        let (result, outbox, _) = process(&stream, &reverse_context());
        assert!(matches!(result, Err(TransportError::Protocol(_))));
        assert!(outbox.bytes.is_empty());

        let (result, _, _) = process(&BR_NOOP.to_ne_bytes()[..2], &reverse_context());
        assert!(matches!(result, Err(TransportError::Protocol(_))));

        let mut stream = Vec::new();
        br(&mut stream, BR_INCREFS, &[0; 8]);
        let (result, outbox, _) = process(&stream, &ContextSlot::default());
        assert!(matches!(result, Err(TransportError::Protocol(_))));
        assert!(outbox.bytes.is_empty());
    }

    #[test]
    fn buffers_outside_the_area_are_refused() {
        for (buffer, size) in [(ARENA_BASE - 8, 4), (ARENA_BASE + 8, 64), (u64::MAX - 1, 4)] {
            let mut stream = Vec::new();
            br(&mut stream, BR_TRANSACTION, &txn_body(1, 0, buffer, size));
            let (result, outbox, stats) = process(&stream, &reverse_context());
            assert!(
                matches!(result, Err(TransportError::Protocol(_))),
                "{buffer:#x}+{size}"
            );
            assert!(outbox.bytes.is_empty());
            assert_eq!(stats.transactions, 0);
        }
    }

    #[test]
    fn replies_free_their_buffer_and_unknown_returns_fail() {
        let mut stream = Vec::new();
        br(&mut stream, BR_REPLY, &txn_body(0, 0, ARENA_BASE, 0));
        let (result, outbox, _) = process(&stream, &ContextSlot::default());
        result.unwrap();
        assert_eq!(
            written(&outbox),
            vec![(BC_FREE_BUFFER, ARENA_BASE.to_ne_bytes().to_vec())]
        );

        let (result, _, _) = process(&0xdead_beef_u32.to_ne_bytes(), &ContextSlot::default());
        assert!(
            matches!(&result, Err(TransportError::Protocol(msg)) if msg.contains("0xdeadbeef")),
            "{result:?}"
        );
    }

    #[test]
    fn drain_stops_when_the_driver_makes_no_progress() {
        assert_eq!(next_round(16, 0, true), Round::Decode(16));
        assert_eq!(next_round(0, 68, true), Round::Flush);
        // Writes pending but none accepted: leave them for the next wake.
        assert_eq!(next_round(0, 0, true), Round::Done);
        assert_eq!(next_round(0, 0, false), Round::Done);
        assert_eq!(next_round(0, 12, false), Round::Done);
    }

    #[test]
    fn area_bounds_are_checked() {
        assert_eq!(offset_within(0x1000, 0x100, 0x1000, 0x100), Some(0));
        assert_eq!(offset_within(0x1000, 0x100, 0x10f0, 0x10), Some(0xf0));
        assert_eq!(offset_within(0x1000, 0x100, 0x10f0, 0x11), None);
        assert_eq!(offset_within(0x1000, 0x100, 0xff0, 0x10), None);
        assert_eq!(offset_within(0x1000, 0x100, u64::MAX, 2), None);
    }
}
