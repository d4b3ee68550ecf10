use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event::Event;
use crate::event_loop::{self, EventLoop, LoopCell, LoopHandle};
use crate::handler::EventHandler;
use crate::sys;
use crate::Token;

/// Fired on state edges: once with the connection `Connected`, once with it
/// `Disconnected`.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired on the owning loop whenever bytes arrive; the callback consumes what
/// it can from the input buffer and leaves partial data for the next read.
pub type MessageCallback = Arc<dyn Fn(&EventLoop, &Arc<TcpConnection>, &mut Buffer) + Send + Sync>;

/// Fired on the owning loop when the output buffer drains completely.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Connection lifecycle states.
///
/// ```text
/// Connecting --connect_established--> Connected
/// Connected  --shutdown------------->  Disconnecting
/// Connected  --peer close / error--->  Disconnected
/// Disconnecting --output drained---->  Disconnected
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// One accepted TCP connection and its state machine.
///
/// A connection is created on the accept loop, then handed to a worker loop
/// where it lives for good: all I/O, buffer and channel mutation happens on
/// that loop, guarded by [`LoopCell`]. The connection itself is shared as an
/// `Arc` (the server map, rooms and in-flight callbacks all hold strong
/// references) and its only thread-safe entry points — [`send`] and
/// [`shutdown`] — copy their arguments and post to the owning loop when
/// called from anywhere else.
///
/// [`send`]: TcpConnection::send
/// [`shutdown`]: TcpConnection::shutdown
/// [`LoopCell`]: crate::LoopCell
pub struct TcpConnection {
    name: String,
    handle: Arc<LoopHandle>,
    // Stored by value; the acceptor's stack frames are long gone by the time
    // these are read.
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    io: LoopCell<ConnIo>,
    on_connection: ConnectionCallback,
    on_message: MessageCallback,
    on_write_complete: Option<WriteCompleteCallback>,
    on_close: CloseCallback,
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    self_ref: Weak<TcpConnection>,
}

struct ConnIo {
    sock: OwnedFd,
    channel: Channel,
    input: Buffer,
    output: Buffer,
}

impl TcpConnection {
    /// Creates a connection in the `Connecting` state. Nothing is registered
    /// with the owning loop until [`connect_established`] runs there.
    ///
    /// [`connect_established`]: TcpConnection::connect_established
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        handle: Arc<LoopHandle>,
        sock: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        on_connection: ConnectionCallback,
        on_message: MessageCallback,
        on_write_complete: Option<WriteCompleteCallback>,
        on_close: CloseCallback,
    ) -> Arc<TcpConnection> {
        let fd = sock.as_raw_fd();
        Arc::new_cyclic(|self_ref| TcpConnection {
            name,
            handle: Arc::clone(&handle),
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            io: LoopCell::new(
                handle,
                ConnIo {
                    sock,
                    channel: Channel::new(fd, Token(0)),
                    input: Buffer::new(),
                    output: Buffer::new(),
                },
            ),
            on_connection,
            on_message,
            on_write_complete,
            on_close,
            context: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The handle of the loop this connection is pinned to.
    pub fn handle(&self) -> &Arc<LoopHandle> {
        &self.handle
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Attaches an opaque session value to the connection.
    pub fn set_context<T: Any + Send + Sync>(&self, value: T) {
        *self.context.lock().unwrap() = Some(Box::new(value));
    }

    /// Clones the session value out, if one of type `T` is attached.
    pub fn context<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.context
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|any| any.downcast_ref::<T>())
            .cloned()
    }

    /// Detaches the session value.
    pub fn take_context(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.context.lock().unwrap().take()
    }

    fn arc(&self) -> Arc<TcpConnection> {
        // The weak reference was created by `Arc::new_cyclic`, and `self` is
        // only reachable through the Arc, so the upgrade cannot fail while a
        // method is executing.
        self.self_ref.upgrade().expect("connection used after drop")
    }

    /// Sends `data` to the peer. Thread-safe.
    ///
    /// On the owning loop a direct non-blocking write is attempted first and
    /// any remainder is copied into the output buffer with write interest
    /// enabled. From any other thread the bytes are copied and the send is
    /// posted to the owning loop; the caller's buffer is never assumed to
    /// outlive the call.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            warn!("{}: send ignored, connection not established", self.name);
            return;
        }
        if self.handle.is_in_loop_thread() {
            let sent = event_loop::try_with_current(|lp| self.send_in_loop(lp, data));
            if sent.is_some() {
                return;
            }
            // Loop not running yet; fall through to the queueing path.
        }
        let data = data.to_vec();
        let conn = self.arc();
        self.handle
            .run_in_loop(move |lp| conn.send_in_loop(lp, &data));
    }

    /// Half-closes the connection once every buffered byte is out.
    ///
    /// The state moves to `Disconnecting` immediately; the FIN goes out now
    /// if the output buffer is empty, otherwise when it drains.
    pub fn shutdown(&self) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.arc();
            self.handle.run_in_loop(move |lp| conn.shutdown_in_loop(lp));
        }
    }

    /// First callback on the owning loop: flips to `Connected`, registers the
    /// channel and fires the user connection callback.
    pub(crate) fn connect_established(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);

        {
            let mut io = self.io.borrow_mut();
            let token = lp.next_token();
            io.channel.set_token(token);
            lp.add_handler(token, self.arc() as Arc<dyn EventHandler>);
            if let Err(err) = io.channel.enable_reading(lp) {
                error!("{}: failed to enable reading: {}", self.name, err);
            }
        }

        trace!("{}: established ({} -> {})", self.name, self.peer_addr, self.local_addr);
        (self.on_connection)(&self.arc());
    }

    /// Last callback on the owning loop; fires the user connection callback
    /// with state `Disconnected` (unless the close path already did) and
    /// unregisters the channel.
    pub(crate) fn connect_destroyed(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if matches!(self.state(), ConnState::Connected | ConnState::Disconnecting) {
            self.set_state(ConnState::Disconnected);
            if let Err(err) = self.io.borrow_mut().channel.disable_all(lp) {
                warn!("{}: failed to disable channel: {}", self.name, err);
            }
            (self.on_connection)(&self.arc());
        }
        let token = self.io.borrow().channel.token();
        lp.remove_handler(token);
        trace!("{}: destroyed", self.name);
    }

    fn send_in_loop(&self, lp: &EventLoop, data: &[u8]) {
        lp.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            warn!("{}: disconnected, dropping {} bytes", self.name, data.len());
            return;
        }

        let mut write_complete = false;
        {
            let mut io = self.io.borrow_mut();
            let fd = io.sock.as_raw_fd();
            let mut nwrote = 0;
            let mut fault = false;

            // Try a direct write when nothing is queued ahead of us.
            if !io.channel.is_writing() && io.output.readable_bytes() == 0 {
                match sys::net::write(fd, data) {
                    Ok(n) => {
                        nwrote = n;
                        if nwrote == data.len() {
                            write_complete = self.on_write_complete.is_some();
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        error!("{}: write failed: {}", self.name, err);
                        if matches!(
                            err.kind(),
                            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                        ) {
                            // Peer is gone; buffering more would only delay
                            // the close the poller is about to report.
                            fault = true;
                        }
                    }
                }
            }

            if !fault && nwrote < data.len() {
                io.output.append(&data[nwrote..]);
                if !io.channel.is_writing() {
                    if let Err(err) = io.channel.enable_writing(lp) {
                        error!("{}: failed to enable writing: {}", self.name, err);
                    }
                }
            }
        }

        if write_complete {
            if let Some(callback) = &self.on_write_complete {
                callback(&self.arc());
            }
        }
    }

    fn shutdown_in_loop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let io = self.io.borrow();
        if !io.channel.is_writing() {
            if let Err(err) = sys::net::shutdown_write(io.sock.as_raw_fd()) {
                error!("{}: shutdown failed: {}", self.name, err);
            }
        }
        // Otherwise handle_write sends the FIN once the buffer drains.
    }

    fn handle_read(&self, lp: &EventLoop) {
        let result = {
            let mut io = self.io.borrow_mut();
            let fd = io.sock.as_raw_fd();
            io.input.read_fd(fd)
        };

        match result {
            Ok(0) => self.handle_close(lp),
            Ok(n) => {
                trace!("{}: read {} bytes", self.name, n);
                // Take the input buffer out for the duration of the callback
                // so the callback may call `send` (which borrows the I/O
                // state) without tripping the re-entrancy check.
                let mut input = std::mem::take(&mut self.io.borrow_mut().input);
                (self.on_message)(lp, &self.arc(), &mut input);
                self.io.borrow_mut().input = input;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("{}: read failed: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self, lp: &EventLoop) {
        let mut write_complete = false;
        {
            let mut io = self.io.borrow_mut();
            if !io.channel.is_writing() {
                trace!("{}: write event with writing disabled", self.name);
                return;
            }
            let fd = io.sock.as_raw_fd();
            match sys::net::write(fd, io.output.peek()) {
                Ok(n) => {
                    io.output.retrieve(n);
                    if io.output.readable_bytes() == 0 {
                        if let Err(err) = io.channel.disable_writing(lp) {
                            error!("{}: failed to disable writing: {}", self.name, err);
                        }
                        write_complete = self.on_write_complete.is_some();
                        if self.state() == ConnState::Disconnecting {
                            // The deferred half-close from `shutdown`.
                            if let Err(err) = sys::net::shutdown_write(fd) {
                                error!("{}: shutdown failed: {}", self.name, err);
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => error!("{}: write failed: {}", self.name, err),
            }
        }

        if write_complete {
            if let Some(callback) = &self.on_write_complete {
                callback(&self.arc());
            }
        }
    }

    fn handle_close(&self, lp: &EventLoop) {
        if self.state() == ConnState::Disconnected {
            return;
        }
        debug!("{}: closed by peer", self.name);
        self.set_state(ConnState::Disconnected);
        if let Err(err) = self.io.borrow_mut().channel.disable_all(lp) {
            warn!("{}: failed to disable channel: {}", self.name, err);
        }

        // Keep a strong reference across the teardown callbacks so the
        // connection outlives its own close notification.
        let guard = self.arc();
        (self.on_connection)(&guard);
        (self.on_close)(&guard);
    }

    fn handle_error(&self) {
        let fd = self.io.borrow().sock.as_raw_fd();
        match sys::net::take_error(fd) {
            Ok(Some(err)) => error!("{}: socket error: {}", self.name, err),
            Ok(None) => {}
            Err(err) => error!("{}: failed to read socket error: {}", self.name, err),
        }
    }
}

impl EventHandler for TcpConnection {
    // Branch order matters: a hang-up with no readable data closes outright,
    // but a hang-up alongside readable data defers to the read path so queued
    // bytes are delivered before the close is observed via read() == 0.
    fn ready(self: Arc<Self>, lp: &EventLoop, event: &Event) {
        trace!("{}: ready {:?}", self.name, event);
        if event.is_hup() && !event.is_readable() {
            self.handle_close(lp);
            return;
        }
        if event.is_error() {
            self.handle_error();
        }
        if event.is_readable() || event.is_read_closed() {
            self.handle_read(lp);
        }
        if event.is_writable() {
            self.handle_write(lp);
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
