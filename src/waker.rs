use std::io;
use std::os::fd::AsRawFd;

use crate::poll::Poller;
use crate::sys;
use crate::{Interest, Token};

/// Allows cross-thread waking of a [`Poller`].
///
/// A `Waker` is backed by an eventfd registered with the poller under the
/// provided token; [`wake`] can be called from any thread and causes the
/// poller to return a readable event for that token. The owning loop must
/// [`ack`] the wakeup once observed, otherwise the level-triggered poller
/// keeps reporting it.
///
/// Only a single `Waker` should be active per [`Poller`]; it is shared across
/// threads via an `Arc`.
///
/// [`wake`]: Waker::wake
/// [`ack`]: Waker::ack
/// [`Poller`]: crate::Poller
#[derive(Debug)]
pub struct Waker {
    inner: sys::eventfd::WakerInternal,
}

impl Waker {
    /// Creates a new `Waker`, registered with `poller` under `token`.
    pub fn new(poller: &Poller, token: Token) -> io::Result<Waker> {
        let inner = sys::eventfd::WakerInternal::new()?;
        poller.register(inner.as_raw_fd(), token, Interest::READABLE)?;
        Ok(Waker { inner })
    }

    /// Wakes the poller associated with this `Waker`.
    pub fn wake(&self) -> io::Result<()> {
        self.inner.wake()
    }

    /// Consumes the pending wakeup. Called by the owning loop when it
    /// dispatches the waker's readiness event.
    pub fn ack(&self) -> io::Result<()> {
        self.inner.reset()
    }
}
