//! Non-blocking TCP: acceptor, connection state machine and server glue.

mod acceptor;
mod connection;
mod server;

pub use self::acceptor::{Acceptor, NewConnectionCallback};
pub use self::connection::{
    ConnState, ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
pub use self::server::TcpServer;
