use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::event::Event;
use crate::event_loop::{EventLoop, LoopCell, LoopHandle};
use crate::handler::EventHandler;
use crate::sys;
use crate::Token;

const BACKLOG: libc::c_int = 1024;

/// Invoked once per accepted connection with the new descriptor and the peer
/// address.
pub type NewConnectionCallback = Box<dyn Fn(OwnedFd, SocketAddr) + Send + Sync>;

/// Owns a listening socket and produces `(fd, peer)` pairs.
///
/// The acceptor lives on the base loop. On readable it accepts in a loop
/// until the kernel reports would-block, handing each new descriptor to the
/// connection callback; without a callback installed, descriptors are closed
/// immediately so they cannot leak.
///
/// A sentinel descriptor (open on `/dev/null`) is held in reserve. When
/// `accept` fails with EMFILE the sentinel is closed to free a slot, the
/// pending connection is accepted and dropped, and the sentinel is re-opened;
/// this drains the kernel accept queue instead of spinning on the error.
pub struct Acceptor {
    local_addr: SocketAddr,
    io: LoopCell<AcceptorIo>,
    on_connection: Mutex<Option<NewConnectionCallback>>,
    self_ref: Weak<Acceptor>,
}

struct AcceptorIo {
    listener: OwnedFd,
    channel: Channel,
    idle_fd: Option<OwnedFd>,
}

impl Acceptor {
    /// Creates the listening socket and binds it. Listening starts later, on
    /// the loop thread, via [`listen`].
    ///
    /// [`listen`]: Acceptor::listen
    pub fn new(
        handle: Arc<LoopHandle>,
        addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let listener = sys::net::new_stream_socket(&addr)?;
        let fd = listener.as_raw_fd();
        sys::net::set_reuseaddr(fd, true)?;
        if reuse_port {
            sys::net::set_reuseport(fd, true)?;
        }
        sys::net::bind(fd, &addr)?;
        let local_addr = sys::net::local_addr(fd)?;
        let idle_fd = sys::net::open_idle_fd()?;

        let channel = Channel::new(fd, Token(0));
        Ok(Arc::new_cyclic(|self_ref| Acceptor {
            local_addr,
            io: LoopCell::new(
                handle,
                AcceptorIo {
                    listener,
                    channel,
                    idle_fd: Some(idle_fd),
                },
            ),
            on_connection: Mutex::new(None),
            self_ref: self_ref.clone(),
        }))
    }

    /// Installs the callback invoked for every accepted connection. Set this
    /// before [`listen`]; accepted descriptors are closed while no callback
    /// is present.
    ///
    /// [`listen`]: Acceptor::listen
    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.on_connection.lock().unwrap() = Some(callback);
    }

    /// Starts listening and registers for readable events. Must run on the
    /// owning loop thread.
    pub fn listen(&self, lp: &EventLoop) -> io::Result<()> {
        lp.assert_in_loop_thread();
        let this = self
            .self_ref
            .upgrade()
            .expect("acceptor used after drop");
        let mut io = self.io.borrow_mut();
        sys::net::listen(io.listener.as_raw_fd(), BACKLOG)?;
        io.channel.set_token(lp.next_token());
        lp.add_handler(io.channel.token(), this as Arc<dyn EventHandler>);
        io.channel.enable_reading(lp)?;
        info!("listening on {}", self.local_addr);
        Ok(())
    }

    /// The bound address; with port 0 this carries the kernel-assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn handle_read(&self, _lp: &EventLoop) {
        let mut io = self.io.borrow_mut();
        let listener = io.listener.as_raw_fd();

        loop {
            match sys::net::accept(listener) {
                Ok((sock, peer)) => {
                    trace!("accepted connection from {}", peer);
                    let callback = self.on_connection.lock().unwrap();
                    match callback.as_ref() {
                        Some(callback) => callback(sock, peer),
                        // Closing right away beats leaking the descriptor.
                        None => debug!("no connection callback, dropping {}", peer),
                    }
                }
                Err(err) => match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) | Some(libc::ECONNABORTED) | Some(libc::EPROTO) => continue,
                    Some(libc::EMFILE) => {
                        error!("accept failed on {}: {}", self.local_addr, err);
                        recover_from_emfile(&mut io, listener);
                    }
                    _ => {
                        error!("accept failed on {}: {}", self.local_addr, err);
                        break;
                    }
                },
            }
        }
    }
}

/// Frees a descriptor by closing the sentinel, accepts and drops the pending
/// connection, then re-arms the sentinel.
fn recover_from_emfile(io: &mut AcceptorIo, listener: libc::c_int) {
    drop(io.idle_fd.take());
    match sys::net::accept(listener) {
        Ok((sock, peer)) => {
            warn!("descriptor limit reached, dropping connection from {}", peer);
            drop(sock);
        }
        Err(err) => warn!("descriptor limit reached, drain failed: {}", err),
    }
    match sys::net::open_idle_fd() {
        Ok(fd) => io.idle_fd = Some(fd),
        Err(err) => warn!("failed to re-open sentinel descriptor: {}", err),
    }
}

impl EventHandler for Acceptor {
    fn ready(self: Arc<Self>, lp: &EventLoop, event: &Event) {
        if event.is_readable() {
            self.handle_read(lp);
        }
    }
}
