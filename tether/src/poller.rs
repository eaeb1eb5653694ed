//! Thin epoll wrapper shared by both reactors.
//!
//! The epoll descriptor itself is the reactor's public pollable handle:
//! readiness on it means "call `poll()` now". Registered descriptors
//! carry their own fd as the event token, which the reactors use to
//! route events back to connection state.

use {
    nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout},
    std::{
        io,
        os::fd::{AsRawFd, BorrowedFd, RawFd},
    },
};

/// Upper bound on events processed per poll batch.
pub(crate) const EVENT_BATCH: usize = 64;

/// Interest set for a connected stream: always readable plus peer-hangup,
/// write interest only while the send queue is non-empty.
pub(crate) fn stream_interest(want_write: bool) -> EpollFlags {
    let mut flags = EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
    if want_write {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

/// Interest set for a non-blocking connect still in flight: writability
/// signals completion.
pub(crate) fn connecting_interest() -> EpollFlags {
    EpollFlags::EPOLLOUT | EpollFlags::EPOLLRDHUP
}

#[derive(Debug)]
pub(crate) struct Poller {
    epoll: Epoll,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epoll })
    }

    /// Register `fd` with the given interest.
    pub fn add(&self, fd: BorrowedFd<'_>, flags: EpollFlags) -> io::Result<()> {
        let token = fd.as_raw_fd() as u64;
        self.epoll.add(fd, EpollEvent::new(flags, token))?;
        Ok(())
    }

    /// Replace the interest set for an already-registered `fd`.
    pub fn modify(&self, fd: BorrowedFd<'_>, flags: EpollFlags) -> io::Result<()> {
        let token = fd.as_raw_fd() as u64;
        let mut event = EpollEvent::new(flags, token);
        self.epoll.modify(fd, &mut event)?;
        Ok(())
    }

    /// Deregister `fd`. Callers tear down sockets right after, so a
    /// not-registered error is not interesting.
    pub fn delete(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.epoll.delete(fd)?;
        Ok(())
    }

    /// Wait for one batch of events. A signal interruption is treated as
    /// an empty batch. Timeouts are capped at `u16::MAX` milliseconds so
    /// a wait can never be infinite.
    pub fn wait(&self, events: &mut [EpollEvent], timeout_ms: u64) -> io::Result<usize> {
        let timeout = EpollTimeout::from(u16::try_from(timeout_ms).unwrap_or(u16::MAX));
        match self.epoll.wait(events, timeout) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EINTR) => Ok(0),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }
}
