//! Multi-room, low-latency voice conferencing on a multi-reactor core.
//!
//! Clients connect over TCP, join a room, stream 20 ms Opus frames and
//! receive one mixed stream of everyone else. The crate is split along the
//! same seams the runtime is:
//!
//! * **Reactor** — [`Poller`] (level-triggered epoll), [`Channel`],
//!   [`EventLoop`] with a timer wheel and an eventfd waker, [`LoopPool`] for
//!   round-robin multi-reactor operation. Every loop is strictly
//!   single-threaded; other threads talk to it through its [`LoopHandle`].
//! * **TCP** — [`Acceptor`], [`TcpConnection`] (buffered, thread-safe
//!   `send`, graceful half-close) and [`TcpServer`] glueing them to the
//!   worker pool.
//! * **Voice** — the length-prefix [`FrameCodec`], the [`protocol`] message
//!   schema, the Opus [`AudioMixer`], [`Room`]s with their 20 ms mix tick and
//!   the [`RoomRegistry`].
//!
//! The [`VoiceServer`] ties all of it together; `src/main.rs` is a thin
//! wrapper that runs one on a port.
//!
//! Linux-only by design: the sys layer speaks epoll, eventfd, timerfd and
//! `accept4` directly.
//!
//! [`protocol`]: crate::Packet

#[macro_use]
mod macros;

mod buffer;
mod channel;
mod codec;
mod event;
mod event_loop;
mod handler;
mod interest;
mod loop_pool;
mod mixer;
mod net;
mod poll;
mod pool;
mod protocol;
mod queue;
mod registry;
mod room;
mod sys;
mod thread_pool;
mod timer;
mod token;
mod voice;
mod waker;

pub use buffer::{Buffer, CHEAP_PREPEND};
pub use channel::Channel;
pub use codec::{
    encode_frame, frame_bytes, split_frame, FrameCallback, FrameCodec, FrameError, HEADER_LEN,
    MAX_FRAME_LEN,
};
pub use event::{Event, Events};
pub use event_loop::{EventLoop, LoopCell, LoopHandle};
pub use handler::EventHandler;
pub use interest::Interest;
pub use loop_pool::{LoopPool, LoopThread};
pub use mixer::{AudioMixer, BITRATE, CHANNELS, FRAME_SAMPLES, MAX_PACKET_LEN, SAMPLE_RATE};
pub use net::{
    Acceptor, ConnState, ConnectionCallback, MessageCallback, NewConnectionCallback,
    TcpConnection, TcpServer, WriteCompleteCallback,
};
pub use poll::Poller;
pub use pool::{Pool, Pooled};
pub use protocol::{Message, NotificationKind, Packet, RoomInfo, RoomNotification};
pub use queue::DrainQueue;
pub use registry::{RoomRegistry, FIRST_ROOM_ID};
pub use room::{Room, User, TICK_INTERVAL};
pub use thread_pool::ThreadPool;
pub use timer::TimerId;
pub use token::Token;
pub use voice::VoiceServer;
pub use waker::Waker;
