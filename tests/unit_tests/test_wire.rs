use std::net::Ipv4Addr;

use bytes::Bytes;
use ovlnet::models::{
    frame::{Frame, FrameError},
    identifier::{HASH_SIZE, Identifier},
    message::{
        K, MAX_MESSAGE_SIZE, MAX_STREAM_PAYLOAD, MsgType, Request, ResultMsg,
        TRIPLE_SIZE, build_announce, build_channel_packet, build_find, build_ping,
        build_result, build_start_stream, read_cookie,
    },
    peer::Node,
};

fn node(port: u16) -> Node {
    Node::new(Identifier::random(), Ipv4Addr::new(10, 1, 2, 3), port)
}

#[test]
fn fixed_request_lengths_are_stable() {
    let cookie = Identifier::random();
    let id = Identifier::random();
    assert_eq!(build_ping(&cookie, &id).len(), 41);
    assert_eq!(build_find(&cookie, MsgType::FindNode, &id).len(), 41);
    assert_eq!(build_find(&cookie, MsgType::FindValue, &id).len(), 41);
    assert_eq!(build_announce(&cookie, &id, &id).len(), 61);
}

#[test]
fn find_and_announce_roundtrip() {
    let cookie = Identifier::random();
    let target = Identifier::random();
    let who = Identifier::random();

    let pkt = build_find(&cookie, MsgType::FindValue, &target);
    assert_eq!(read_cookie(&pkt).expect("cookie"), cookie);
    match Request::parse(&pkt[HASH_SIZE..]).expect("parse") {
        Request::FindValue { target: got } => assert_eq!(got, target),
        other => panic!("wrong request: {other:?}"),
    }

    let pkt = build_announce(&cookie, &target, &who);
    match Request::parse(&pkt[HASH_SIZE..]).expect("parse") {
        Request::Announce { what, who: got } => {
            assert_eq!(what, target);
            assert_eq!(got, who);
        },
        other => panic!("wrong request: {other:?}"),
    }
}

#[test]
fn result_serializes_at_most_k_triples() {
    let cookie = Identifier::random();
    let nodes: Vec<Node> = (0..2 * K as u16).map(node).collect();
    let pkt = build_result(&cookie, true, &nodes);
    assert_eq!(pkt.len(), HASH_SIZE + 1 + K * TRIPLE_SIZE);
    assert!(pkt.len() <= MAX_MESSAGE_SIZE);

    let parsed = ResultMsg::parse(&pkt[HASH_SIZE..]).expect("parse");
    assert!(parsed.success);
    assert_eq!(parsed.triples.len(), K);
    for (got, want) in parsed.triples.iter().zip(nodes.iter()) {
        assert_eq!(got, want);
    }
}

#[test]
fn truncated_requests_are_rejected() {
    let cookie = Identifier::random();
    let pkt = build_ping(&cookie, &Identifier::random());
    assert!(Request::parse(&pkt[HASH_SIZE..pkt.len() - 1]).is_err());
    assert!(Request::parse(&[]).is_err());
    // An announce missing its owner id.
    let pkt = build_announce(&cookie, &Identifier::random(), &Identifier::random());
    assert!(Request::parse(&pkt[HASH_SIZE..pkt.len() - HASH_SIZE]).is_err());
}

#[test]
fn start_stream_carries_service_and_blob() {
    let cookie = Identifier::random();
    let pkt = build_start_stream(&cookie, 0x0200, b"handshake-bytes");
    match Request::parse(&pkt[HASH_SIZE..]).expect("parse") {
        Request::StartStream { service, handshake } => {
            assert_eq!(service, 0x0200);
            assert_eq!(&handshake[..], b"handshake-bytes");
        },
        other => panic!("wrong request: {other:?}"),
    }
}

#[test]
fn channel_packet_layout() {
    let cookie = Identifier::random();
    let pkt = build_channel_packet(&cookie, 0x01020304, b"ciphertext");
    assert_eq!(&pkt[..HASH_SIZE], cookie.as_bytes());
    assert_eq!(&pkt[HASH_SIZE..HASH_SIZE + 4], &[1, 2, 3, 4]);
    assert_eq!(&pkt[HASH_SIZE + 4..], b"ciphertext");
}

#[test]
fn frame_roundtrips_and_bounds() {
    let data = Frame::Data {
        seq: 42,
        payload: Bytes::from(vec![7u8; MAX_STREAM_PAYLOAD]),
    };
    let encoded = data.encode();
    assert_eq!(encoded.len(), 5 + MAX_STREAM_PAYLOAD);
    assert_eq!(Frame::parse(&encoded).expect("parse"), data);

    let ack = Frame::Ack { seq: 9, window: 0xffff };
    assert_eq!(Frame::parse(&ack.encode()).expect("parse"), ack);
    assert_eq!(Frame::parse(&Frame::Reset.encode()).expect("parse"), Frame::Reset);
    assert_eq!(Frame::parse(&Frame::Fin.encode()).expect("parse"), Frame::Fin);

    assert_eq!(Frame::parse(&[0, 1, 2]), Err(FrameError::Truncated { got: 3 }));
    assert!(matches!(Frame::parse(&[0xee]), Err(FrameError::UnknownType(0xee))));
}
