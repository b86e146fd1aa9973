use ovlnet::stream::ring::{CAPACITY, FixedRingBuffer};
use rand::RngExt;

/// Random interleaving of writes and reads must deliver exactly the
/// written bytes, in order.
#[test]
fn interleaved_writes_and_reads_preserve_the_byte_stream() {
    let mut rng = rand::rng();
    let mut ring = FixedRingBuffer::new();
    let mut expected: Vec<u8> = Vec::new();
    let mut delivered: Vec<u8> = Vec::new();
    let mut written_total = 0usize;

    for _ in 0..2000 {
        if rng.random_bool(0.5) {
            let len = rng.random_range(1..2000);
            let chunk: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            let accepted = ring.write(&chunk);
            expected.extend_from_slice(&chunk[..accepted]);
            written_total += accepted;
        } else {
            let len = rng.random_range(1..3000);
            let mut out = vec![0u8; len];
            let got = ring.read(&mut out);
            delivered.extend_from_slice(&out[..got]);
        }
    }
    // Drain whatever is left.
    let mut out = vec![0u8; CAPACITY];
    let got = ring.read(&mut out);
    delivered.extend_from_slice(&out[..got]);

    assert_eq!(delivered.len(), written_total);
    assert_eq!(delivered, expected);
}

#[test]
fn available_plus_free_is_always_capacity() {
    let mut rng = rand::rng();
    let mut ring = FixedRingBuffer::new();
    for _ in 0..500 {
        if rng.random_bool(0.6) {
            let chunk: Vec<u8> = (0..rng.random_range(1..5000)).map(|_| rng.random()).collect();
            ring.write(&chunk);
        } else {
            ring.drop_front(rng.random_range(1..5000));
        }
        assert_eq!(ring.available() + ring.free(), CAPACITY);
    }
}

#[test]
fn peek_does_not_consume() {
    let mut ring = FixedRingBuffer::new();
    ring.write(b"watermark");
    let mut a = [0u8; 9];
    let mut b = [0u8; 9];
    assert_eq!(ring.peek(0, &mut a), 9);
    assert_eq!(ring.peek(0, &mut b), 9);
    assert_eq!(a, b);
    assert_eq!(ring.available(), 9);
    assert_eq!(ring.peek(5, &mut a[..4]), 4);
    assert_eq!(&a[..4], b"mark");
}
