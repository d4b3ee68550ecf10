//! Message schema carried inside the wire frames.
//!
//! Every frame payload starts with a one-byte kind tag. Control packets and
//! room notifications are JSON bodies; audio frames stay raw so a 20 ms Opus
//! packet costs one byte of envelope.

use std::io;

use serde::{Deserialize, Serialize};

const TAG_PACKET: u8 = 0;
const TAG_NOTIFICATION: u8 = 1;
const TAG_AUDIO: u8 = 2;

/// Control-plane packets, travelling both directions.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Packet {
    Login { username: String },
    LoginOk { user_id: u64 },
    CreateRoom { name: String },
    RoomCreated { room_id: u64 },
    JoinRoom { room_id: u64 },
    JoinOk { room_id: u64, name: String },
    LeaveRoom,
    ListRooms,
    RoomList { rooms: Vec<RoomInfo> },
    Chat { text: String },
    ChatFrom { user_id: u64, username: String, text: String },
    Error { message: String },
}

/// One room in a [`Packet::RoomList`] reply.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RoomInfo {
    pub id: u64,
    pub name: String,
    pub members: usize,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationKind {
    Join,
    Leave,
}

/// Pushed to remaining room members when membership changes.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RoomNotification {
    pub kind: NotificationKind,
    pub user_id: u64,
    pub username: String,
    /// Human-readable line, e.g. `"alice joined the room"`.
    pub message: String,
}

/// Everything that travels inside a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Control(Packet),
    Notification(RoomNotification),
    /// An opaque encoded audio frame; the codec is none of the envelope's
    /// business.
    Audio(Vec<u8>),
}

impl Message {
    /// Serializes tag + body into a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Control(packet) => {
                let mut out = vec![TAG_PACKET];
                out.extend(serde_json::to_vec(packet).expect("packet serialization cannot fail"));
                out
            }
            Message::Notification(note) => {
                let mut out = vec![TAG_NOTIFICATION];
                out.extend(serde_json::to_vec(note).expect("notification serialization cannot fail"));
                out
            }
            Message::Audio(frame) => {
                let mut out = Vec::with_capacity(1 + frame.len());
                out.push(TAG_AUDIO);
                out.extend_from_slice(frame);
                out
            }
        }
    }

    /// Parses a frame payload. Failures are typed-decode errors, which the
    /// server treats like framing violations: the sending connection is shut
    /// down.
    pub fn decode(payload: &[u8]) -> io::Result<Message> {
        let (&tag, body) = payload
            .split_first()
            .ok_or_else(|| invalid("empty message payload"))?;
        match tag {
            TAG_PACKET => serde_json::from_slice(body)
                .map(Message::Control)
                .map_err(|err| invalid(format!("bad control packet: {}", err))),
            TAG_NOTIFICATION => serde_json::from_slice(body)
                .map(Message::Notification)
                .map_err(|err| invalid(format!("bad notification: {}", err))),
            TAG_AUDIO => Ok(Message::Audio(body.to_vec())),
            tag => Err(invalid(format!("unknown message tag {}", tag))),
        }
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_round_trip() {
        let original = Message::Control(Packet::JoinOk {
            room_id: 1001,
            name: "ops".to_string(),
        });
        let decoded = Message::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn notification_round_trip() {
        let original = Message::Notification(RoomNotification {
            kind: NotificationKind::Leave,
            user_id: 3,
            username: "bob".to_string(),
            message: "bob left the room".to_string(),
        });
        let decoded = Message::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn audio_is_passed_through_raw() {
        let frame = vec![0x01, 0xff, 0x00, 0x7f];
        let encoded = Message::Audio(frame.clone()).encode();
        assert_eq!(encoded.len(), frame.len() + 1);
        assert_eq!(Message::decode(&encoded).unwrap(), Message::Audio(frame));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Message::decode(&[]).is_err());
        assert!(Message::decode(&[9, b'{']).is_err());
        assert!(Message::decode(&[0, b'n', b'o']).is_err());
    }
}
