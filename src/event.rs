//! Readiness events.

use std::fmt;

use crate::sys;
use crate::Token;

/// A readiness event.
///
/// `Event` is a readiness state paired with a [`Token`]. It is returned by
/// [`Poller::poll`].
///
/// [`Token`]: crate::Token
/// [`Poller::poll`]: crate::Poller::poll
#[repr(transparent)]
pub struct Event {
    inner: sys::epoll::Event,
}

impl Event {
    /// Returns the event's token.
    #[inline]
    pub fn token(&self) -> Token {
        sys::epoll::event::token(&self.inner)
    }

    /// Returns true if the event contains readable readiness.
    #[inline]
    pub fn is_readable(&self) -> bool {
        sys::epoll::event::is_readable(&self.inner)
    }

    /// Returns true if the event contains writable readiness.
    #[inline]
    pub fn is_writable(&self) -> bool {
        sys::epoll::event::is_writable(&self.inner)
    }

    /// Returns true if the event contains error readiness.
    ///
    /// Error events occur when the socket enters an error state. In this case,
    /// the socket will also receive a readable or writable event. Reading or
    /// writing to the socket will result in an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        sys::epoll::event::is_error(&self.inner)
    }

    /// Returns true if the event contains HUP readiness.
    ///
    /// On epoll a plain HUP means both halves of the connection are gone. A
    /// HUP that arrives together with readable readiness must be handed to
    /// the read path first so queued bytes are not lost; [`is_hup`] alone is
    /// therefore not a close signal.
    ///
    /// [`is_hup`]: Event::is_hup
    #[inline]
    pub fn is_hup(&self) -> bool {
        sys::epoll::event::is_hup(&self.inner)
    }

    /// Returns true if the event contains read-closed readiness: the peer
    /// sent a FIN or shut down its write half.
    #[inline]
    pub fn is_read_closed(&self) -> bool {
        sys::epoll::event::is_read_closed(&self.inner)
    }

    fn from_sys_event_ref(sys_event: &sys::epoll::Event) -> &Event {
        // SAFETY: `Event` is `#[repr(transparent)]` around `sys::epoll::Event`.
        unsafe { &*(sys_event as *const sys::epoll::Event as *const Event) }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("token", &self.token())
            .field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .field("error", &self.is_error())
            .field("hup", &self.is_hup())
            .field("read_closed", &self.is_read_closed())
            .finish()
    }
}

/// A collection of readiness events.
///
/// `Events` is passed as an argument to [`Poller::poll`] and will be used to
/// receive any new readiness events received since the last poll. Usually, a
/// single `Events` instance is created at the same time as a [`Poller`] and
/// reused on each call.
///
/// [`Poller::poll`]: crate::Poller::poll
/// [`Poller`]: crate::Poller
pub struct Events {
    inner: sys::epoll::Events,
}

impl Events {
    /// Returns a new `Events` capable of holding up to `capacity` events.
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Returns the number of `Event` values that `self` can hold.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Returns `true` if `self` contains no `Event` values.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the number of events.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns an iterator over the events.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.inner.iter(),
        }
    }

    /// Clearing is done by the poller before each poll; the events remain
    /// valid until then.
    pub(crate) fn sys_mut(&mut self) -> &mut sys::epoll::Events {
        &mut self.inner
    }

    /// Doubles capacity. Called by the poller when a poll saturated the
    /// vector, so the next cycle can absorb a larger readiness burst.
    pub(crate) fn grow(&mut self) {
        self.inner.reserve_exact(self.inner.capacity());
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// [`Events`] iterator.
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    inner: std::slice::Iter<'a, sys::epoll::Event>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Event;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(Event::from_sys_event_ref)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
