use std::io;
use std::os::fd::RawFd;

use crate::event_loop::EventLoop;
use crate::{Interest, Token};

/// Binds a descriptor to its interest set within one [`EventLoop`].
///
/// A `Channel` is owned by the object servicing the descriptor (connection,
/// acceptor) and may only be mutated on the owning loop thread; every
/// interest change goes through the loop, which asserts the calling thread
/// before touching its poller.
///
/// Dispatch ordering for a ready channel is: hang-up without readable data
/// closes first, then the error path, then reads (including read-closed, so
/// bytes queued ahead of a FIN are not lost), then writes. The ordering is
/// applied by the handler servicing the channel; see
/// [`TcpConnection`](crate::TcpConnection).
///
/// [`EventLoop`]: crate::EventLoop
#[derive(Debug)]
pub struct Channel {
    fd: RawFd,
    token: Token,
    interest: Option<Interest>,
    registered: bool,
}

impl Channel {
    /// Creates an idle channel for `fd`. Nothing is registered until the
    /// first `enable_*` call.
    pub fn new(fd: RawFd, token: Token) -> Channel {
        Channel {
            fd,
            token,
            interest: None,
            registered: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Rebinds the channel to a token allocated by the owning loop. Must
    /// happen before the channel is first enabled.
    pub(crate) fn set_token(&mut self, token: Token) {
        debug_assert!(!self.registered);
        self.token = token;
    }

    pub fn is_reading(&self) -> bool {
        self.interest.is_some_and(|i| i.is_readable())
    }

    pub fn is_writing(&self) -> bool {
        self.interest.is_some_and(|i| i.is_writable())
    }

    pub fn enable_reading(&mut self, lp: &EventLoop) -> io::Result<()> {
        self.add_interest(lp, Interest::READABLE)
    }

    pub fn enable_writing(&mut self, lp: &EventLoop) -> io::Result<()> {
        self.add_interest(lp, Interest::WRITABLE)
    }

    pub fn disable_reading(&mut self, lp: &EventLoop) -> io::Result<()> {
        self.del_interest(lp, Interest::READABLE)
    }

    pub fn disable_writing(&mut self, lp: &EventLoop) -> io::Result<()> {
        self.del_interest(lp, Interest::WRITABLE)
    }

    /// Drops all interest and deregisters the descriptor from the poller.
    /// Required before the channel's handler is removed from the loop.
    pub fn disable_all(&mut self, lp: &EventLoop) -> io::Result<()> {
        self.interest = None;
        self.update(lp)
    }

    fn add_interest(&mut self, lp: &EventLoop, interest: Interest) -> io::Result<()> {
        self.interest = Some(match self.interest {
            Some(current) => current | interest,
            None => interest,
        });
        self.update(lp)
    }

    fn del_interest(&mut self, lp: &EventLoop, interest: Interest) -> io::Result<()> {
        self.interest = self.interest.and_then(|current| current.remove(interest));
        self.update(lp)
    }

    fn update(&mut self, lp: &EventLoop) -> io::Result<()> {
        let poller = lp.poller();
        match (self.interest, self.registered) {
            (Some(interest), true) => poller.reregister(self.fd, self.token, interest),
            (Some(interest), false) => {
                poller.register(self.fd, self.token, interest)?;
                self.registered = true;
                Ok(())
            }
            (None, true) => {
                poller.deregister(self.fd)?;
                self.registered = false;
                Ok(())
            }
            (None, false) => Ok(()),
        }
    }
}
