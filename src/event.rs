//! Readiness multiplexer over a fixed-size descriptor table.
//!
//! A thin, single-threaded wrapper around `poll(2)`: two arrays kept in
//! lockstep, one of `pollfd` records handed to the kernel and one of
//! engine-owned tags. A slot is vacant iff its fd is `-1`; a high-water
//! mark bounds both the poll call and the dispatch sweep.
//!
//! The table is generic over a `Copy` tag so the engine can store a small
//! token (listener / pair id + side) per registration and dispatch on it,
//! instead of a callback pointer and a shared userdata pointer.
//!
//! Reentrancy rule: `modify` and `remove` clear a slot's pending readiness
//! bits, so a sweep that is part-way through the table never dispatches a
//! slot that was retargeted or vacated earlier in the same sweep.

use std::io;
use std::os::fd::RawFd;

use crate::error::{Error, Result};

/// Capacity of the event table.
pub const MAX_EVENTS: usize = 512;

/// The readiness kinds a registration asks to be woken for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    /// Wake when the fd is readable
    Readable,
    /// Wake when the fd is writable
    Writable,
    /// Wake for either direction
    Both,
}

impl Interest {
    fn poll_bits(self) -> libc::c_short {
        match self {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
            Interest::Both => libc::POLLIN | libc::POLLOUT,
        }
    }
}

/// Readiness bits reported by the kernel for one descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness(libc::c_short);

impl Readiness {
    /// Data can be read without blocking.
    pub fn readable(self) -> bool {
        self.0 & libc::POLLIN != 0
    }

    /// Data can be written without blocking.
    pub fn writable(self) -> bool {
        self.0 & libc::POLLOUT != 0
    }

    /// The peer hung up.
    pub fn hangup(self) -> bool {
        self.0 & libc::POLLHUP != 0
    }

    /// An error condition is pending on the descriptor.
    pub fn error(self) -> bool {
        self.0 & libc::POLLERR != 0
    }

    /// The descriptor is not open; the table is out of sync.
    pub fn invalid(self) -> bool {
        self.0 & libc::POLLNVAL != 0
    }

    #[cfg(test)]
    fn from_bits(bits: libc::c_short) -> Self {
        Readiness(bits)
    }
}

/// Fixed-capacity readiness table.
pub struct EventLoop<T> {
    pfds: Vec<libc::pollfd>,
    tags: Vec<Option<T>>,
    capacity: usize,
    live: usize,
}

impl<T: Copy> EventLoop<T> {
    /// Create an empty table with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(MAX_EVENTS)
    }

    /// Create an empty table with an explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pfds: Vec::with_capacity(capacity),
            tags: Vec::with_capacity(capacity),
            capacity,
            live: 0,
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether the table has no live registrations.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// One past the highest slot that may be live; bounds dispatch sweeps.
    pub fn high_water(&self) -> usize {
        self.pfds.len()
    }

    /// Register a descriptor.
    ///
    /// Rejects descriptors that are already present and fails with a
    /// capacity error when the table is full. The first vacant slot below
    /// the high-water mark is reused before the table grows.
    pub fn add(&mut self, fd: RawFd, interest: Interest, tag: T) -> Result<()> {
        debug_assert!(fd >= 0);

        if self.position(fd).is_some() {
            return Err(Error::DuplicateFd(fd));
        }
        if self.live == self.capacity {
            return Err(Error::Capacity(self.capacity));
        }

        let pfd = libc::pollfd {
            fd,
            events: interest.poll_bits(),
            revents: 0,
        };

        match self.pfds.iter().position(|p| p.fd == -1) {
            Some(idx) => {
                self.pfds[idx] = pfd;
                self.tags[idx] = Some(tag);
            }
            None => {
                self.pfds.push(pfd);
                self.tags.push(Some(tag));
            }
        }
        self.live += 1;

        Ok(())
    }

    /// Change the interest mask of a registered descriptor.
    ///
    /// Clears any pending readiness so the current sweep does not
    /// re-dispatch the slot on stale state.
    pub fn modify(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        let idx = self.position(fd).ok_or(Error::UnknownFd(fd))?;

        self.pfds[idx].events = interest.poll_bits();
        self.pfds[idx].revents = 0;

        Ok(())
    }

    /// Unregister a descriptor.
    ///
    /// The slot is vacated (fd `-1`, no interest, no pending readiness,
    /// tag cleared); the high-water mark shrinks past trailing vacancies.
    pub fn remove(&mut self, fd: RawFd) -> Result<()> {
        let idx = self.position(fd).ok_or(Error::UnknownFd(fd))?;

        self.pfds[idx] = libc::pollfd {
            fd: -1,
            events: 0,
            revents: 0,
        };
        self.tags[idx] = None;
        self.live -= 1;

        while self.pfds.last().is_some_and(|p| p.fd == -1) {
            self.pfds.pop();
            self.tags.pop();
        }

        Ok(())
    }

    /// Block until readiness or timeout (`-1` blocks indefinitely).
    ///
    /// Returns the number of descriptors with pending readiness. A signal
    /// interruption reports zero readiness so the caller re-checks its run
    /// flag; any other poll failure is fatal.
    pub fn wait(&mut self, timeout_ms: i32) -> Result<usize> {
        let rc = unsafe {
            libc::poll(
                self.pfds.as_mut_ptr(),
                self.pfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                for pfd in &mut self.pfds {
                    pfd.revents = 0;
                }
                return Ok(0);
            }
            return Err(Error::Network(err));
        }

        Ok(rc as usize)
    }

    /// Inspect one slot of the current sweep.
    ///
    /// Returns the descriptor, its readiness, and its tag, or `None` if
    /// the slot is vacant or has no pending readiness (including slots
    /// vacated earlier in the same sweep).
    pub fn ready(&self, idx: usize) -> Option<(RawFd, Readiness, T)> {
        let pfd = self.pfds.get(idx)?;
        if pfd.fd == -1 || pfd.revents == 0 {
            return None;
        }

        debug_assert!(self.tags[idx].is_some(), "tag missing for live slot");
        let tag = self.tags[idx]?;

        Some((pfd.fd, Readiness(pfd.revents), tag))
    }

    fn position(&self, fd: RawFd) -> Option<usize> {
        self.pfds.iter().position(|p| p.fd == fd)
    }
}

impl<T: Copy> Default for EventLoop<T> {
    fn default() -> Self {
        Self::new()
    }
}
