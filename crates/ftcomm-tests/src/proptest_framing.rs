//! Property-Based Tests for Framing - frames survive arbitrary TCP segmentation

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ftcomm_transport::protocol::{
    ConnectRequest, ConnectResponse, ConnectResult, MessageHeader, CONNECT_RESPONSE_LEN, DEFAULT_MAGIC,
    DEFAULT_VERSION,
};
use ftcomm_transport::{MessageType, Server};
use parking_lot::Mutex;
use proptest::prelude::*;

use crate::harness::{server_options, start_server, wait_until};

type Received = Arc<Mutex<Vec<(MessageType, Bytes)>>>;

fn collecting_server() -> (Server, SocketAddr, Received) {
    let server = Server::new(server_options(1, 64));
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    for msg_type in [MessageType::Report, MessageType::Echo, MessageType::Heartbeat] {
        let sink = received.clone();
        server
            .register_request_handler(msg_type, move |ctx| sink.lock().push((msg_type, ctx.body().clone())))
            .unwrap();
    }
    let addr = start_server(&server);
    (server, addr, received)
}

/// Opens a raw socket and completes the connect handshake by hand.
fn raw_connect(addr: SocketAddr, rank: u64) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_nodelay(true).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let request = ConnectRequest {
        magic: DEFAULT_MAGIC,
        version: DEFAULT_VERSION,
        rank_id: rank,
    };
    stream.write_all(&request.encode()).unwrap();
    let mut raw = [0u8; CONNECT_RESPONSE_LEN];
    stream.read_exact(&mut raw).unwrap();
    assert_eq!(ConnectResponse::decode(&raw).result, ConnectResult::Accepted);
    stream
}

fn encode_frames(frames: &[(MessageType, Vec<u8>)]) -> Vec<u8> {
    let mut wire = Vec::new();
    for (seq, (msg_type, body)) in frames.iter().enumerate() {
        let mut header = MessageHeader::new(*msg_type, 0, body.len() as u32);
        header.seq_no = seq as u32 + 1;
        wire.extend_from_slice(&header.encode());
        wire.extend_from_slice(body);
    }
    wire
}

fn msg_type_strategy() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Report),
        Just(MessageType::Echo),
        Just(MessageType::Heartbeat),
    ]
}

#[test]
fn test_bad_magic_rejected() {
    let (server, addr, _) = collecting_server();
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let request = ConnectRequest {
        magic: DEFAULT_MAGIC ^ 0x0101,
        version: DEFAULT_VERSION,
        rank_id: 1,
    };
    stream.write_all(&request.encode()).unwrap();
    let mut raw = [0u8; CONNECT_RESPONSE_LEN];
    stream.read_exact(&mut raw).unwrap();
    assert_eq!(ConnectResponse::decode(&raw).result, ConnectResult::BadMagic);
    assert!(server.link(1).is_none());
}

#[test]
fn test_oversized_frame_dropped_link_survives() {
    let mut options = server_options(1, 4);
    options.transport.max_body_len = 1024;
    let server = Server::new(options);
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    server
        .register_request_handler(MessageType::Report, move |ctx| {
            sink.lock().push((MessageType::Report, ctx.body().clone()))
        })
        .unwrap();
    let addr = start_server(&server);

    let mut stream = raw_connect(addr, 2);
    let wire = encode_frames(&[
        (MessageType::Report, vec![1u8; 4096]),
        (MessageType::Report, b"small".to_vec()),
    ]);
    stream.write_all(&wire).unwrap();

    assert!(wait_until(Duration::from_secs(5), || received.lock().len() == 1));
    assert_eq!(received.lock()[0].1, Bytes::from_static(b"small"));
    assert!(server.link(2).is_some_and(|l| !l.is_broken()));
    assert!(wait_until(Duration::from_secs(5), || server.link(2).is_some_and(|l| l.dropped_frames() == 1)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_frames_survive_segmentation(
        frames in proptest::collection::vec(
            (msg_type_strategy(), proptest::collection::vec(any::<u8>(), 0..3000)),
            1..12,
        ),
        chunks in proptest::collection::vec(1usize..700, 1..40),
    ) {
        let (server, addr, received) = collecting_server();
        let mut stream = raw_connect(addr, 77);
        let wire = encode_frames(&frames);

        let mut offset = 0;
        let mut cut = chunks.iter().cycle();
        while offset < wire.len() {
            let len = (*cut.next().unwrap()).min(wire.len() - offset);
            stream.write_all(&wire[offset..offset + len]).unwrap();
            stream.flush().unwrap();
            offset += len;
            if len % 3 == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        prop_assert!(wait_until(Duration::from_secs(5), || received.lock().len() == frames.len()));
        let got = received.lock().clone();
        for ((want_type, want_body), (got_type, got_body)) in frames.iter().zip(got.iter()) {
            prop_assert_eq!(want_type, got_type);
            prop_assert_eq!(&want_body[..], &got_body[..]);
        }
        server.stop();
    }
}
