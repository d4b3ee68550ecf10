use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use log::trace;

use crate::event::Events;
use crate::sys;
use crate::{Interest, Token};

/// Polls for readiness events on all registered descriptors.
///
/// `Poller` is a thin wrapper around the kernel's readiness facility (epoll,
/// level-triggered). Descriptors are registered with a [`Token`] and an
/// [`Interest`]; [`poll`] blocks until at least one registered descriptor is
/// ready or the timeout elapses, and fills the caller's [`Events`].
///
/// Every [`EventLoop`] owns exactly one `Poller`. A `Poller` must never be
/// shared across threads; cross-thread work is handed to a loop through its
/// [`LoopHandle`], not by touching its poller.
///
/// [`poll`]: Poller::poll
/// [`EventLoop`]: crate::EventLoop
/// [`LoopHandle`]: crate::LoopHandle
#[derive(Debug)]
pub struct Poller {
    selector: sys::epoll::Selector,
}

impl Poller {
    /// Returns a new `Poller` handle, backed by a fresh epoll instance.
    pub fn new() -> io::Result<Poller> {
        let selector = sys::epoll::Selector::new()?;
        Ok(Poller { selector })
    }

    /// Registers `fd` for the given interest.
    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        trace!("registering fd {} with poller: {:?}", fd, interests);
        self.selector.register(fd, token, interests)
    }

    /// Changes the interest of an already registered `fd`.
    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        trace!("reregistering fd {} with poller: {:?}", fd, interests);
        self.selector.reregister(fd, token, interests)
    }

    /// Removes `fd` from the readiness set.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        trace!("deregistering fd {} from poller", fd);
        self.selector.deregister(fd)
    }

    /// Waits for readiness events, blocking at most `timeout` (forever when
    /// `None`).
    ///
    /// When a poll comes back with the event vector completely full, the
    /// vector's capacity is doubled so the next cycle can report the rest of
    /// the burst in one go.
    pub fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.selector.select(events.sys_mut(), timeout)?;
        if events.len() == events.capacity() {
            events.grow();
        }
        Ok(())
    }
}
