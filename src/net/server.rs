use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, warn};

use crate::buffer::Buffer;
use crate::event_loop::LoopHandle;
use crate::loop_pool::LoopPool;
use crate::net::acceptor::Acceptor;
use crate::net::connection::{
    CloseCallback, ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::sys;

struct Callbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
}

/// Wires the acceptor to a pool of worker loops and owns every connection.
///
/// Accepted sockets are assigned to worker loops round-robin; the connection
/// object is created on the accept loop and establishes itself on its worker
/// loop. The server keeps the strong reference that defines each connection's
/// lifetime: a connection is dropped only after the close path removed it
/// from the map and `connect_destroyed` ran on its loop.
pub struct TcpServer {
    name: String,
    base: Arc<LoopHandle>,
    acceptor: Arc<Acceptor>,
    workers: usize,
    pool: Mutex<Option<LoopPool>>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    callbacks: Mutex<Callbacks>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    self_ref: Weak<TcpServer>,
}

impl TcpServer {
    /// Binds the listening socket. Callbacks are installed afterwards and
    /// workers spawn on [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn new(
        base: Arc<LoopHandle>,
        addr: SocketAddr,
        name: &str,
        workers: usize,
    ) -> io::Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(Arc::clone(&base), addr, true)?;

        let server = Arc::new_cyclic(|self_ref| TcpServer {
            name: name.to_string(),
            base,
            acceptor,
            workers,
            pool: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Callbacks {
                connection: Arc::new(|conn| {
                    debug!("{}: {:?}", conn.name(), conn.state());
                }),
                message: Arc::new(|_lp, conn, buf: &mut Buffer| {
                    debug!("{}: discarding {} bytes", conn.name(), buf.readable_bytes());
                    buf.retrieve_all();
                }),
                write_complete: None,
            }),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |sock, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(sock, peer);
                }
            }));

        Ok(server)
    }

    /// Replaces the connection (state edge) callback. Set before [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = callback;
    }

    /// Replaces the message callback. Set before [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.lock().unwrap().message = callback;
    }

    /// Installs the write-complete callback. Set before [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(callback);
    }

    /// Spawns the worker pool and starts listening. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pool = LoopPool::start(
            Arc::clone(&self.base),
            self.workers,
            &format!("{}-io", self.name),
        )?;
        *self.pool.lock().unwrap() = Some(pool);

        let acceptor = Arc::clone(&self.acceptor);
        let name = self.name.clone();
        self.base.run_in_loop(move |lp| {
            if let Err(err) = acceptor.listen(lp) {
                error!("{}: listen failed: {}", name, err);
            }
        });
        Ok(())
    }

    /// The listening address, with the kernel-assigned port when bound to 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Destroys every connection and stops the worker pool.
    pub fn stop(&self) {
        let connections: Vec<_> = {
            let mut map = self.connections.lock().unwrap();
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            let handle = Arc::clone(conn.handle());
            handle.run_in_loop(move |lp| conn.connect_destroyed(lp));
        }
        if let Some(mut pool) = self.pool.lock().unwrap().take() {
            pool.stop();
        }
    }

    fn new_connection(&self, sock: OwnedFd, peer_addr: SocketAddr) {
        let handle = match self.pool.lock().unwrap().as_ref() {
            Some(pool) => pool.next_loop(),
            None => {
                warn!("{}: connection from {} before start", self.name, peer_addr);
                return;
            }
        };

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{}", self.name, self.local_addr(), id);
        let raw = sock.as_raw_fd();

        let local_addr = match sys::net::local_addr(raw) {
            Ok(addr) => addr,
            Err(err) => {
                warn!("{}: getsockname failed: {}", name, err);
                self.local_addr()
            }
        };
        // Voice frames are small and latency-bound; never wait for Nagle.
        if let Err(err) = sys::net::set_nodelay(raw, true) {
            warn!("{}: failed to set TCP_NODELAY: {}", name, err);
        }

        let (connection_cb, message_cb, write_complete_cb) = {
            let callbacks = self.callbacks.lock().unwrap();
            (
                Arc::clone(&callbacks.connection),
                Arc::clone(&callbacks.message),
                callbacks.write_complete.clone(),
            )
        };
        let weak = self.self_ref.clone();
        let close_cb: CloseCallback = Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        });

        let conn = TcpConnection::new(
            name.clone(),
            Arc::clone(&handle),
            sock,
            local_addr,
            peer_addr,
            connection_cb,
            message_cb,
            write_complete_cb,
            close_cb,
        );

        info!("{}: new connection [{}] from {}", self.name, name, peer_addr);
        self.connections.lock().unwrap().insert(name, Arc::clone(&conn));
        handle.run_in_loop(move |lp| conn.connect_established(lp));
    }

    /// Runs on the connection's loop thread, via its close callback.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        info!("{}: removing connection [{}]", self.name, conn.name());
        self.connections.lock().unwrap().remove(conn.name());

        let handle = Arc::clone(conn.handle());
        let conn = Arc::clone(conn);
        // Queued, not inline: the destroy must run after the dispatch that
        // triggered the close finishes with the channel.
        handle.queue_in_loop(move |lp| conn.connect_destroyed(lp));
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}
