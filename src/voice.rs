use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info, trace, warn};

use crate::codec::FrameCodec;
use crate::event_loop::LoopHandle;
use crate::net::{ConnState, TcpConnection, TcpServer};
use crate::protocol::{Message, Packet};
use crate::registry::RoomRegistry;
use crate::room::{Room, User};

/// The control plane: login, rooms, chat and audio dispatch.
///
/// `VoiceServer` owns a [`TcpServer`] and installs the framing codec as its
/// message callback. Each decoded frame lands here: control packets mutate
/// session and room state, audio frames are routed into the sender's room for
/// the next mix tick. The session (an `Arc<User>`) rides in the connection's
/// context slot from login to disconnect.
///
/// [`TcpServer`]: crate::TcpServer
pub struct VoiceServer {
    server: Arc<TcpServer>,
    registry: Arc<RoomRegistry>,
    next_user_id: AtomicU64,
}

impl VoiceServer {
    /// Binds the listening socket and wires codec and callbacks. The registry
    /// is injected so tests (and embedders) control where rooms tick.
    pub fn new(
        base: Arc<LoopHandle>,
        addr: SocketAddr,
        workers: usize,
        registry: Arc<RoomRegistry>,
    ) -> io::Result<Arc<VoiceServer>> {
        let server = TcpServer::new(base, addr, "lightvoice", workers)?;

        let voice = Arc::new(VoiceServer {
            server: Arc::clone(&server),
            registry,
            next_user_id: AtomicU64::new(1),
        });

        let weak: Weak<VoiceServer> = Arc::downgrade(&voice);
        let codec = FrameCodec::new(Arc::new(move |_lp, conn, payload| {
            if let Some(voice) = weak.upgrade() {
                voice.on_frame(conn, payload);
            }
        }));
        server.set_message_callback(codec.into_message_callback());

        let weak: Weak<VoiceServer> = Arc::downgrade(&voice);
        server.set_connection_callback(Arc::new(move |conn| match conn.state() {
            ConnState::Connected => debug!("{}: connected", conn.name()),
            _ => {
                if let Some(voice) = weak.upgrade() {
                    voice.on_disconnect(conn);
                }
            }
        }));

        Ok(voice)
    }

    pub fn start(&self) -> io::Result<()> {
        self.server.start()
    }

    pub fn stop(&self) {
        self.server.stop()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }

    fn on_frame(&self, conn: &Arc<TcpConnection>, payload: Vec<u8>) {
        match Message::decode(&payload) {
            Ok(Message::Control(packet)) => self.on_packet(conn, packet),
            Ok(Message::Audio(frame)) => self.on_audio(conn, frame),
            Ok(Message::Notification(_)) => {
                warn!("{}: unexpected notification from client", conn.name());
            }
            Err(err) => {
                // Typed-decode failure is as fatal as a framing violation.
                error!("{}: {}", conn.name(), err);
                conn.shutdown();
            }
        }
    }

    fn on_audio(&self, conn: &Arc<TcpConnection>, frame: Vec<u8>) {
        let user = match self.session(conn) {
            Some(user) => user,
            None => {
                trace!("{}: audio before login, dropped", conn.name());
                return;
            }
        };
        match user.room() {
            Some(room) => room.on_audio(user.id(), frame),
            None => trace!("{}: audio outside a room, dropped", conn.name()),
        }
    }

    fn on_packet(&self, conn: &Arc<TcpConnection>, packet: Packet) {
        match packet {
            Packet::Login { username } => {
                if self.session(conn).is_some() {
                    self.reply_error(conn, "already logged in");
                    return;
                }
                let id = self.next_user_id.fetch_add(1, Ordering::Relaxed);
                let user = User::new(id, &username, Arc::clone(conn));
                conn.set_context(user);
                info!("{}: logged in as {} (user {})", conn.name(), username, id);
                self.reply(conn, Packet::LoginOk { user_id: id });
            }
            Packet::CreateRoom { name } => {
                let user = match self.require_login(conn) {
                    Some(user) => user,
                    None => return,
                };
                match self.registry.create(&name, user.id()) {
                    Ok(room) => self.reply(conn, Packet::RoomCreated { room_id: room.id() }),
                    Err(err) => {
                        error!("{}: failed to create room: {}", conn.name(), err);
                        self.reply_error(conn, "failed to create room");
                    }
                }
            }
            Packet::JoinRoom { room_id } => {
                let user = match self.require_login(conn) {
                    Some(user) => user,
                    None => return,
                };
                let room = match self.registry.find(room_id) {
                    Some(room) => room,
                    None => {
                        self.reply_error(conn, "no such room");
                        return;
                    }
                };
                if let Some(current) = user.room() {
                    self.leave_room(&user, &current);
                }
                room.add_user(&user);
                self.reply(
                    conn,
                    Packet::JoinOk {
                        room_id: room.id(),
                        name: room.name().to_string(),
                    },
                );
            }
            Packet::LeaveRoom => {
                let user = match self.require_login(conn) {
                    Some(user) => user,
                    None => return,
                };
                match user.room() {
                    Some(room) => self.leave_room(&user, &room),
                    None => self.reply_error(conn, "not in a room"),
                }
            }
            Packet::ListRooms => {
                self.reply(
                    conn,
                    Packet::RoomList {
                        rooms: self.registry.list(),
                    },
                );
            }
            Packet::Chat { text } => {
                let user = match self.require_login(conn) {
                    Some(user) => user,
                    None => return,
                };
                let room = match user.room() {
                    Some(room) => room,
                    None => {
                        self.reply_error(conn, "not in a room");
                        return;
                    }
                };
                room.broadcast(
                    &Message::Control(Packet::ChatFrom {
                        user_id: user.id(),
                        username: user.username().to_string(),
                        text,
                    }),
                    Some(user.id()),
                );
            }
            other => {
                // Server-to-client kinds coming back from a client.
                warn!("{}: unexpected packet {:?}", conn.name(), other);
            }
        }
    }

    fn leave_room(&self, user: &Arc<User>, room: &Arc<Room>) {
        room.remove_user(user.id());
        // An empty room has nothing left to mix for; reclaim it.
        if room.member_count() == 0 {
            self.registry.destroy(room.id());
        }
    }

    fn on_disconnect(&self, conn: &Arc<TcpConnection>) {
        if let Some(user) = self.session(conn) {
            conn.take_context();
            if let Some(room) = user.room() {
                self.leave_room(&user, &room);
            }
            info!("{}: user {} disconnected", conn.name(), user.username());
        }
    }

    fn session(&self, conn: &Arc<TcpConnection>) -> Option<Arc<User>> {
        conn.context::<Arc<User>>()
    }

    fn require_login(&self, conn: &Arc<TcpConnection>) -> Option<Arc<User>> {
        let user = self.session(conn);
        if user.is_none() {
            self.reply_error(conn, "login required");
        }
        user
    }

    fn reply(&self, conn: &Arc<TcpConnection>, packet: Packet) {
        FrameCodec::send(conn, &Message::Control(packet).encode());
    }

    fn reply_error(&self, conn: &Arc<TcpConnection>, message: &str) {
        self.reply(
            conn,
            Packet::Error {
                message: message.to_string(),
            },
        );
    }
}
