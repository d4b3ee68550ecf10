use std::fmt;
use std::sync::Arc;

use log::error;

use crate::buffer::Buffer;
use crate::event_loop::EventLoop;
use crate::net::{MessageCallback, TcpConnection};

/// Size of the length prefix, in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload a frame may carry. Anything longer on the wire is a
/// protocol violation, not a large message.
pub const MAX_FRAME_LEN: usize = 65_536;

/// Invoked once per complete frame with the payload bytes.
pub type FrameCallback = Arc<dyn Fn(&EventLoop, &Arc<TcpConnection>, Vec<u8>) + Send + Sync>;

/// Fatal framing violations. These close the connection; the peers sharing
/// the server are unaffected.
#[derive(Debug, Eq, PartialEq)]
pub enum FrameError {
    /// The length prefix exceeded [`MAX_FRAME_LEN`].
    Oversize(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Oversize(len) => {
                write!(f, "frame length {} exceeds limit {}", len, MAX_FRAME_LEN)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Length-prefix framing over a byte stream: `[u32 big-endian length][payload]`.
///
/// The codec sits between a [`TcpConnection`]'s raw message callback and the
/// application: it reassembles frames from however the bytes were segmented,
/// invokes the frame callback once per complete payload, and shuts the
/// connection down on a violating length prefix. It keeps no state of its own
/// between invocations; partial frames simply stay in the connection's input
/// buffer.
///
/// [`TcpConnection`]: crate::TcpConnection
pub struct FrameCodec {
    on_frame: FrameCallback,
}

impl FrameCodec {
    pub fn new(on_frame: FrameCallback) -> FrameCodec {
        FrameCodec { on_frame }
    }

    /// Wraps the codec into the message callback shape [`TcpServer`] expects.
    ///
    /// [`TcpServer`]: crate::TcpServer
    pub fn into_message_callback(self) -> MessageCallback {
        Arc::new(move |lp, conn, buf| self.on_message(lp, conn, buf))
    }

    fn on_message(&self, lp: &EventLoop, conn: &Arc<TcpConnection>, buf: &mut Buffer) {
        loop {
            match split_frame(buf) {
                Ok(Some(payload)) => (self.on_frame)(lp, conn, payload),
                Ok(None) => break,
                Err(err) => {
                    error!("{}: {}", conn.name(), err);
                    conn.shutdown();
                    break;
                }
            }
        }
    }

    /// Frames `payload` and sends it on `conn`. The length header goes into
    /// the buffer's reserved prefix, so framing costs no extra allocation.
    pub fn send(conn: &TcpConnection, payload: &[u8]) {
        let buf = encode_frame(payload);
        conn.send(buf.peek());
    }
}

/// Builds a framed [`Buffer`]: payload appended, length stamped into the
/// prepend region.
pub fn encode_frame(payload: &[u8]) -> Buffer {
    debug_assert!(payload.len() <= MAX_FRAME_LEN);
    let mut buf = Buffer::with_capacity(payload.len());
    buf.append(payload);
    buf.prepend(&(payload.len() as u32).to_be_bytes());
    buf
}

/// Frames `payload` into an owned vector. Used by fan-out paths that encode
/// once and send the same bytes to many connections.
pub fn frame_bytes(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_FRAME_LEN);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// One decode step: consumes and returns the next complete frame, or `None`
/// when the buffer holds only part of one. Prefix and payload are consumed
/// atomically; a partial frame leaves the buffer untouched.
pub fn split_frame(buf: &mut Buffer) -> Result<Option<Vec<u8>>, FrameError> {
    if buf.readable_bytes() < HEADER_LEN {
        return Ok(None);
    }
    let len = buf.peek_u32() as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversize(len));
    }
    if buf.readable_bytes() < HEADER_LEN + len {
        return Ok(None);
    }
    buf.retrieve(HEADER_LEN);
    Ok(Some(buf.retrieve_vec(len)))
}

#[cfg(test)]
mod tests {
    use super::{encode_frame, frame_bytes, split_frame, FrameError, MAX_FRAME_LEN};
    use crate::buffer::Buffer;

    #[test]
    fn round_trip() {
        let mut buf = encode_frame(b"hello");
        assert_eq!(buf.readable_bytes(), 4 + 5);
        assert_eq!(split_frame(&mut buf), Ok(Some(b"hello".to_vec())));
        assert_eq!(split_frame(&mut buf), Ok(None));
    }

    #[test]
    fn empty_payload_is_valid() {
        let mut buf = encode_frame(b"");
        assert_eq!(split_frame(&mut buf), Ok(Some(Vec::new())));
    }

    #[test]
    fn concatenated_frames_decode_in_order() {
        let mut buf = Buffer::new();
        buf.append(&frame_bytes(b"first"));
        buf.append(&frame_bytes(b"second"));

        assert_eq!(split_frame(&mut buf), Ok(Some(b"first".to_vec())));
        assert_eq!(split_frame(&mut buf), Ok(Some(b"second".to_vec())));
        assert_eq!(split_frame(&mut buf), Ok(None));
    }

    #[test]
    fn partial_frame_waits() {
        let framed = frame_bytes(b"partial");
        let mut buf = Buffer::new();

        // Header split across arrivals.
        buf.append(&framed[..2]);
        assert_eq!(split_frame(&mut buf), Ok(None));
        buf.append(&framed[2..6]);
        assert_eq!(split_frame(&mut buf), Ok(None));
        assert_eq!(buf.readable_bytes(), 6);

        buf.append(&framed[6..]);
        assert_eq!(split_frame(&mut buf), Ok(Some(b"partial".to_vec())));
    }

    #[test]
    fn max_length_is_allowed() {
        let payload = vec![0x5a; MAX_FRAME_LEN];
        let mut buf = Buffer::new();
        buf.append(&frame_bytes(&payload));
        assert_eq!(split_frame(&mut buf), Ok(Some(payload)));
    }

    #[test]
    fn oversize_length_is_fatal() {
        let mut buf = Buffer::new();
        buf.append_u32(MAX_FRAME_LEN as u32 + 1);
        assert_eq!(
            split_frame(&mut buf),
            Err(FrameError::Oversize(MAX_FRAME_LEN + 1))
        );
    }

    // Frames must reassemble identically no matter how the stream is cut up.
    #[test]
    fn random_segmentation_reassembles() {
        use rand::Rng;
        let mut rng = rand::rng();

        let payloads: Vec<Vec<u8>> = (0..32)
            .map(|_| {
                let len = rng.random_range(0..512);
                (0..len).map(|_| rng.random()).collect()
            })
            .collect();

        let mut wire = Vec::new();
        for payload in &payloads {
            wire.extend_from_slice(&frame_bytes(payload));
        }

        let mut buf = Buffer::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        while offset < wire.len() {
            let chunk = rng.random_range(1..=64.min(wire.len() - offset));
            buf.append(&wire[offset..offset + chunk]);
            offset += chunk;
            while let Some(payload) = split_frame(&mut buf).unwrap() {
                decoded.push(payload);
            }
        }

        assert_eq!(decoded, payloads);
    }
}
