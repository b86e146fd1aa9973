use std::time::Duration;

use ovlnet::stream::{inbuf::StreamInBuffer, outbuf::StreamOutBuffer};
use rand::{RngExt, seq::SliceRandom};

/// A contiguous 16 KiB range chopped into segments and delivered in a
/// random order reassembles to the original bytes.
#[test]
fn random_permutation_reassembles_in_order() {
    let mut rng = rand::rng();
    let total = 16 * 1024;
    let payload: Vec<u8> = (0..total).map(|_| rng.random()).collect();

    // Chop into segments of 1..=900 bytes covering the range exactly once.
    let mut segments: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut at = 0usize;
    while at < total {
        let len = rng.random_range(1..=900).min(total - at);
        segments.push((at as u32, payload[at..at + len].to_vec()));
        at += len;
    }
    segments.shuffle(&mut rng);

    let mut buf = StreamInBuffer::new();
    let mut released = 0usize;
    for (seq, data) in &segments {
        released += buf.put_packet(*seq, data);
    }
    assert_eq!(released, total);
    assert_eq!(buf.available(), total);
    assert_eq!(buf.next_sequence(), total as u32);

    let mut out = vec![0u8; total];
    assert_eq!(buf.read(&mut out), total);
    assert_eq!(out, payload);
}

#[test]
fn duplicate_segment_releases_nothing_new() {
    let mut buf = StreamInBuffer::new();
    assert_eq!(buf.put_packet(0, b"abcdef"), 6);
    assert_eq!(buf.put_packet(0, b"abcdef"), 0);
    assert_eq!(buf.available(), 6);
}

#[test]
fn gap_holds_back_release_until_filled() {
    let mut buf = StreamInBuffer::new();
    assert_eq!(buf.put_packet(10, b"0123456789"), 0);
    assert_eq!(buf.put_packet(20, b"0123456789"), 0);
    assert_eq!(buf.available(), 0);
    // Filling the gap releases everything at once.
    assert_eq!(buf.put_packet(0, b"0123456789"), 30);
    assert_eq!(buf.next_sequence(), 30);
}

/// Freed space equals the acked span at every step of a partial-ack
/// sequence.
#[test]
fn partial_acks_track_first_sequence() {
    let mut rng = rand::rng();
    let mut buf = StreamOutBuffer::new(Duration::from_millis(100));
    let written = buf.write(&vec![0x5a; 40_000]);
    assert_eq!(written, 40_000);

    let mut acked = 0u32;
    while acked < written as u32 {
        let step = rng.random_range(1..=4096).min(written as u32 - acked);
        let freed = buf.ack(acked + step, 0xffff);
        assert_eq!(freed, step as usize);
        acked += step;
        assert_eq!(buf.first_sequence(), acked);
        assert_eq!(buf.available(), written - acked as usize);
    }
    assert_eq!(buf.first_sequence(), buf.next_sequence());
}

#[test]
fn ack_outside_the_unacked_range_changes_nothing() {
    let mut buf = StreamOutBuffer::new(Duration::from_millis(100));
    buf.write(&[1u8; 500]);
    assert_eq!(buf.ack(501, 0xffff), 0);
    assert_eq!(buf.ack(0, 0xffff), 0);
    assert_eq!(buf.first_sequence(), 0);
    assert_eq!(buf.available(), 500);
}

#[test]
fn remote_window_caps_writes() {
    let mut buf = StreamOutBuffer::new(Duration::from_millis(100));
    buf.write(&[1u8; 100]);
    buf.write(&[2u8; 100]);
    assert_eq!(buf.available(), 200);
    // The ack shrinks the remote window to 150 bytes.
    assert_eq!(buf.ack(200, 150), 200);
    assert_eq!(buf.write(&[3u8; 400]), 150);
}

/// The retransmission path of a lost first segment: the timeout fires,
/// resend returns the segment with its original sequence number, and
/// the late ACK still frees it.
#[test]
fn lost_segment_resends_with_original_sequence() {
    let mut buf = StreamOutBuffer::new(Duration::from_millis(1));
    buf.write(b"first segment");
    std::thread::sleep(Duration::from_millis(10));
    assert!(buf.timed_out());

    let mut dst = [0u8; 64];
    let (len, seq) = buf.resend(&mut dst);
    assert_eq!((len, seq), (13, 0));
    assert!(!buf.timed_out());

    assert_eq!(buf.ack(13, 0xffff), 13);
    assert_eq!(buf.available(), 0);
}
