use std::io::{Read, Write};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use lightvoice::{
    FrameCodec, LoopThread, Message, NotificationKind, Packet, TcpConnection, TcpServer,
    FRAME_SAMPLES, SAMPLE_RATE,
};

mod util;

use util::{assert_send, assert_sync, init, opus_encode, start_voice_server, wait_for, TestClient};

#[test]
fn connection_is_send_and_sync() {
    assert_send::<Arc<TcpConnection>>();
    assert_sync::<TcpConnection>();
}

#[test]
fn delivers_one_message_per_frame() {
    init();
    let base = LoopThread::spawn("frame-base").unwrap();
    let server = TcpServer::new(
        Arc::clone(base.handle()),
        "127.0.0.1:0".parse().unwrap(),
        "frame-test",
        1,
    )
    .unwrap();

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let tx = Mutex::new(tx);
    let codec = FrameCodec::new(Arc::new(move |_lp, _conn, payload| {
        tx.lock().unwrap().send(payload).unwrap();
    }));
    server.set_message_callback(codec.into_message_callback());
    server.start().unwrap();

    let mut stream = util::connect(server.local_addr());
    stream.write_all(&[0, 0, 0, 5]).unwrap();
    stream.write_all(b"hello").unwrap();

    let payload = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(payload, b"hello");
    // Exactly once: no phantom second delivery.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    server.stop();
}

#[test]
fn oversize_frame_closes_the_connection() {
    let server = start_voice_server(1);

    let mut stream = util::connect(server.addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    // 65537: one past the limit.
    stream.write_all(&[0x00, 0x01, 0x00, 0x01]).unwrap();

    // The server must shut the connection down; we observe the FIN as EOF.
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn bytes_sent_across_threads_arrive_in_order() {
    init();
    let base = LoopThread::spawn("order-base").unwrap();
    let server = TcpServer::new(
        Arc::clone(base.handle()),
        "127.0.0.1:0".parse().unwrap(),
        "order-test",
        1,
    )
    .unwrap();

    // Capture the server-side connection as it comes up.
    let (conn_tx, conn_rx) = mpsc::channel::<Arc<TcpConnection>>();
    let conn_tx = Mutex::new(conn_tx);
    server.set_connection_callback(Arc::new(move |conn| {
        if conn.is_connected() {
            let _ = conn_tx.lock().unwrap().send(Arc::clone(conn));
        }
    }));
    server.start().unwrap();

    let mut stream = util::connect(server.local_addr());
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let conn = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // One producer thread, many sends; submission order must be byte order.
    let producer = thread::spawn(move || {
        for i in 0..100u32 {
            conn.send(&i.to_be_bytes());
        }
    });
    producer.join().unwrap();

    let mut received = vec![0u8; 400];
    stream.read_exact(&mut received).unwrap();
    for i in 0..100u32 {
        let at = (i * 4) as usize;
        let got = u32::from_be_bytes(received[at..at + 4].try_into().unwrap());
        assert_eq!(got, i);
    }

    server.stop();
}

#[test]
fn audio_is_mixed_and_fanned_out_every_tick() {
    let server = start_voice_server(2);

    let mut alice = TestClient::connect(server.addr);
    alice.login("alice");
    let room_id = alice.create_room("jam");
    alice.join_room(room_id);

    let mut bob = TestClient::connect(server.addr);
    bob.login("bob");
    bob.join_room(room_id);

    // Alice streams 10 silent frames, paced at the 20 ms cadence.
    let mut encoder =
        opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip).unwrap();
    let silence = vec![0i16; FRAME_SAMPLES];
    for _ in 0..10 {
        let frame = opus_encode(&mut encoder, &silence);
        alice.send_audio(&frame);
        thread::sleep(Duration::from_millis(20));
    }

    // Collect what bob hears within a generous window.
    bob.stream
        .set_read_timeout(Some(Duration::from_millis(400)))
        .unwrap();
    let mut audio_frames = 0;
    while let Ok(message) = bob.read_message() {
        if let Message::Audio(frame) = message {
            assert!(!frame.is_empty());
            audio_frames += 1;
        }
    }

    // One mixed packet per tick with jitter tolerance; coalesced ticks under
    // scheduler pressure may merge a frame or two.
    assert!(
        (8..=11).contains(&audio_frames),
        "got {} audio frames",
        audio_frames
    );
}

#[test]
fn chat_is_relayed_to_other_members() {
    let server = start_voice_server(1);

    let mut alice = TestClient::connect(server.addr);
    let alice_id = alice.login("alice");
    let room_id = alice.create_room("text");
    alice.join_room(room_id);

    let mut bob = TestClient::connect(server.addr);
    bob.login("bob");
    bob.join_room(room_id);

    alice.send_packet(Packet::Chat {
        text: "hi bob".to_string(),
    });

    match bob.read_message().expect("no chat") {
        Message::Control(Packet::ChatFrom {
            user_id,
            username,
            text,
        }) => {
            assert_eq!(user_id, alice_id);
            assert_eq!(username, "alice");
            assert_eq!(text, "hi bob");
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn disconnect_notifies_remaining_members() {
    let server = start_voice_server(1);

    let mut alice = TestClient::connect(server.addr);
    alice.login("alice");
    let room_id = alice.create_room("lossy");
    alice.join_room(room_id);

    let mut bob = TestClient::connect(server.addr);
    let bob_id = bob.login("bob");
    bob.join_room(room_id);

    // Alice first hears the join...
    match alice.read_message().expect("no join notification") {
        Message::Notification(note) => {
            assert_eq!(note.kind, NotificationKind::Join);
            assert_eq!(note.user_id, bob_id);
            assert_eq!(note.username, "bob");
        }
        other => panic!("unexpected message: {:?}", other),
    }

    // ...then bob's TCP connection dies.
    drop(bob);
    match alice.read_message().expect("no leave notification") {
        Message::Notification(note) => {
            assert_eq!(note.kind, NotificationKind::Leave);
            assert_eq!(note.user_id, bob_id);
            assert!(note.message.contains("left"));
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn many_clients_are_accepted_across_the_pool() {
    let server = start_voice_server(4);

    let mut clients = Vec::new();
    for i in 0..20 {
        let mut client = TestClient::connect(server.addr);
        client.login(&format!("user-{}", i));
        clients.push(client);
    }

    assert!(wait_for(Duration::from_secs(5), || {
        server.voice.connection_count() == 20
    }));

    drop(clients);
    assert!(wait_for(Duration::from_secs(5), || {
        server.voice.connection_count() == 0
    }));
}
