// Author: Lukas Bower
#![allow(unsafe_code)]

//! `epoll(7)` backend for the looper.
//!
//! The epoll instance is created on first use, so a failure to create it
//! surfaces from the first registration like any other registration error.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{EventMask, PollBackend, ReadyEvent};

const MAX_EVENTS: usize = 16;

/// Looper backend built on a lazily created epoll instance.
#[derive(Debug)]
pub struct EpollBackend {
    epfd: Option<OwnedFd>,
    events: Vec<libc::epoll_event>,
}

impl Default for EpollBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EpollBackend {
    /// Backend with no epoll instance yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epfd: None,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        }
    }

    fn instance(&mut self) -> io::Result<RawFd> {
        if let Some(epfd) = &self.epfd {
            return Ok(epfd.as_raw_fd());
        }
        // SAFETY: plain syscall, result checked before use.
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a fresh descriptor owned by nobody else.
        self.epfd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
        log::debug!("[looper] epoll instance fd={raw}");
        Ok(raw)
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, mask: EventMask) -> io::Result<()> {
        let epfd = self.instance()?;
        let mut event = libc::epoll_event {
            events: to_epoll(mask),
            u64: fd as u64,
        };
        // SAFETY: `event` outlives the call; the kernel copies it.
        let rc = unsafe { libc::epoll_ctl(epfd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn to_epoll(mask: EventMask) -> u32 {
    let mut bits = 0u32;
    if mask.contains(EventMask::INPUT) {
        bits |= libc::EPOLLIN as u32;
    }
    if mask.contains(EventMask::OUTPUT) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn from_epoll(bits: u32) -> EventMask {
    let mut mask = EventMask::empty();
    if bits & libc::EPOLLIN as u32 != 0 {
        mask |= EventMask::INPUT;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        mask |= EventMask::OUTPUT;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        mask |= EventMask::ERROR;
    }
    if bits & libc::EPOLLHUP as u32 != 0 {
        mask |= EventMask::HANGUP;
    }
    mask
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            // Round up so a sub-millisecond timeout still sleeps.
            let ms = timeout.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

impl PollBackend for EpollBackend {
    fn register(&mut self, fd: RawFd, mask: EventMask) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
    }

    fn modify(&mut self, fd: RawFd, mask: EventMask) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.epfd.is_none() {
            return Ok(());
        }
        self.ctl(libc::EPOLL_CTL_DEL, fd, EventMask::empty())
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<ReadyEvent>) -> io::Result<()> {
        let epfd = self.instance()?;
        // SAFETY: the buffer holds `events.len()` initialised entries.
        let count = unsafe {
            libc::epoll_wait(
                epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for event in &self.events[..count as usize] {
            let token = event.u64;
            let bits = event.events;
            ready.push(ReadyEvent {
                fd: token as RawFd,
                events: from_epoll(bits),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn reports_readable_socket() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let mut backend = EpollBackend::new();
        backend.register(rx.as_raw_fd(), EventMask::INPUT).unwrap();

        let mut ready = Vec::new();
        backend
            .wait(Some(Duration::from_millis(0)), &mut ready)
            .unwrap();
        assert!(ready.is_empty());

        tx.write_all(b"x").unwrap();
        backend
            .wait(Some(Duration::from_secs(5)), &mut ready)
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd, rx.as_raw_fd());
        assert!(ready[0].events.contains(EventMask::INPUT));
    }

    #[test]
    fn instance_is_created_by_first_registration() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        let mut backend = EpollBackend::new();
        assert!(backend.epfd.is_none());
        backend.deregister(rx.as_raw_fd()).unwrap();
        assert!(backend.epfd.is_none());

        backend.register(rx.as_raw_fd(), EventMask::INPUT).unwrap();
        let first = backend.epfd.as_ref().map(AsRawFd::as_raw_fd);
        assert!(first.is_some());
        backend.modify(rx.as_raw_fd(), EventMask::INPUT).unwrap();
        assert_eq!(backend.epfd.as_ref().map(AsRawFd::as_raw_fd), first);
    }

    #[test]
    fn indefinite_timeout_maps_to_minus_one() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::from_micros(10))), 1);
    }
}
