// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Once};
use std::time::Duration;

use lightvoice::{LoopThread, Message, Packet, RoomRegistry, VoiceServer};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}

/// A running voice server plus the loops it lives on. Dropping this tears
/// everything down (server first, then loops).
pub struct TestServer {
    pub voice: Arc<VoiceServer>,
    pub addr: SocketAddr,
    // Drop order: server stops before its loops join.
    _base: LoopThread,
    _mix: LoopThread,
}

pub fn start_voice_server(workers: usize) -> TestServer {
    init();
    let base = LoopThread::spawn("test-base").expect("failed to spawn base loop");
    let mix = LoopThread::spawn("test-mix").expect("failed to spawn mix loop");
    let registry = Arc::new(RoomRegistry::new(Arc::clone(mix.handle())));

    let addr = "127.0.0.1:0".parse().unwrap();
    let voice = VoiceServer::new(Arc::clone(base.handle()), addr, workers, registry)
        .expect("failed to create voice server");
    voice.start().expect("failed to start voice server");

    TestServer {
        addr: voice.local_addr(),
        voice,
        _base: base,
        _mix: mix,
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.voice.stop();
    }
}

/// Connects with retries: the server's listen call runs asynchronously on
/// its base loop, so the very first connect of a test can race it.
pub fn connect(addr: SocketAddr) -> TcpStream {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(err) if std::time::Instant::now() < deadline => {
                let _ = err;
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(err) => panic!("failed to connect to {}: {}", addr, err),
        }
    }
}

/// Blocking wire client speaking the frame + message protocol.
pub struct TestClient {
    pub stream: TcpStream,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> TestClient {
        let stream = connect(addr);
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        TestClient { stream }
    }

    pub fn send_frame(&mut self, payload: &[u8]) {
        let len = (payload.len() as u32).to_be_bytes();
        self.stream.write_all(&len).unwrap();
        self.stream.write_all(payload).unwrap();
    }

    pub fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header)?;
        let len = u32::from_be_bytes(header) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    pub fn send_message(&mut self, message: &Message) {
        self.send_frame(&message.encode());
    }

    pub fn send_packet(&mut self, packet: Packet) {
        self.send_message(&Message::Control(packet));
    }

    pub fn send_audio(&mut self, frame: &[u8]) {
        self.send_message(&Message::Audio(frame.to_vec()));
    }

    pub fn read_message(&mut self) -> io::Result<Message> {
        let payload = self.read_frame()?;
        Message::decode(&payload)
    }

    /// Logs in and returns the assigned user id.
    pub fn login(&mut self, username: &str) -> u64 {
        self.send_packet(Packet::Login {
            username: username.to_string(),
        });
        match self.read_message().expect("no login reply") {
            Message::Control(Packet::LoginOk { user_id }) => user_id,
            other => panic!("unexpected login reply: {:?}", other),
        }
    }

    /// Creates a room and returns its id.
    pub fn create_room(&mut self, name: &str) -> u64 {
        self.send_packet(Packet::CreateRoom {
            name: name.to_string(),
        });
        match self.read_message().expect("no create reply") {
            Message::Control(Packet::RoomCreated { room_id }) => room_id,
            other => panic!("unexpected create reply: {:?}", other),
        }
    }

    pub fn join_room(&mut self, room_id: u64) {
        self.send_packet(Packet::JoinRoom { room_id });
        match self.read_message().expect("no join reply") {
            Message::Control(Packet::JoinOk { room_id: id, .. }) => assert_eq!(id, room_id),
            other => panic!("unexpected join reply: {:?}", other),
        }
    }
}

/// Polls `predicate` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

/// Encodes one 20 ms frame. Tests keep their own encoder so consecutive
/// frames share state, as a real client's would.
pub fn opus_encode(encoder: &mut opus::Encoder, pcm: &[i16]) -> Vec<u8> {
    let mut out = vec![0u8; 4000];
    let n = encoder.encode(pcm, &mut out).expect("opus encode failed");
    out.truncate(n);
    out
}
