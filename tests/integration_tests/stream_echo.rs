use std::time::Duration;

use anyhow::Result;
use ovlnet::{
    models::message::MAX_STREAM_PAYLOAD,
    node::service::RejectAllServices,
    services::echo::{ECHO_SERVICE, EchoService},
};
use serial_test::serial;

use crate::integration_tests::common::{node_ref, start_node};

/// Write "hello" into an echo stream and read it back.
#[tokio::test]
#[serial]
async fn echo_roundtrip() -> Result<()> {
    let server = start_node(Box::new(EchoService)).await?;
    let client = start_node(Box::new(RejectAllServices)).await?;

    let stream = client.start_stream(ECHO_SERVICE, node_ref(&server)).await?;

    assert_eq!(stream.write(b"hello").await?, 5);
    let mut buf = [0u8; 32];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read_some(&mut buf))
        .await
        .expect("echo within one round trip");
    assert_eq!(&buf[..n], b"hello");

    // The peer's ACK drained every unacknowledged byte.
    let drained = tokio::time::timeout(Duration::from_secs(1), async {
        while stream.bytes_to_write() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "out-buffer still holds unacked bytes");

    stream.close().await;
    client.shutdown();
    server.shutdown();
    Ok(())
}

/// A payload bigger than one DATA frame crosses in bounded writes and
/// arrives intact and in order.
#[tokio::test]
#[serial]
async fn echo_large_payload_in_bounded_writes() -> Result<()> {
    let server = start_node(Box::new(EchoService)).await?;
    let client = start_node(Box::new(RejectAllServices)).await?;
    let stream = client.start_stream(ECHO_SERVICE, node_ref(&server)).await?;

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let mut sent = 0usize;
    let mut received = Vec::with_capacity(payload.len());
    let mut buf = vec![0u8; 4096];

    let shuttle = async {
        while received.len() < payload.len() {
            if sent < payload.len() {
                let n = stream.write(&payload[sent..]).await?;
                assert!(n <= MAX_STREAM_PAYLOAD);
                sent += n;
                if n == 0 {
                    stream.writable().await;
                }
            }
            if stream.available() > 0 {
                let n = stream.read(&mut buf);
                received.extend_from_slice(&buf[..n]);
            } else if sent >= payload.len() {
                let n = stream.read_some(&mut buf).await;
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
        }
        anyhow::Ok(())
    };
    tokio::time::timeout(Duration::from_secs(10), shuttle)
        .await
        .expect("echo shuttle stalled")?;
    assert_eq!(received, payload);

    stream.close().await;
    client.shutdown();
    server.shutdown();
    Ok(())
}

/// Closing twice emits exactly one closed transition, and the peer
/// observes the RESET.
#[tokio::test]
#[serial]
async fn close_is_idempotent_and_resets_the_peer() -> Result<()> {
    let server = start_node(Box::new(EchoService)).await?;
    let client = start_node(Box::new(RejectAllServices)).await?;
    let stream = client.start_stream(ECHO_SERVICE, node_ref(&server)).await?;

    assert!(!stream.is_closed());
    stream.close().await;
    assert!(stream.is_closed());
    // Second close is a no-op.
    stream.close().await;
    assert!(stream.is_closed());

    // The closed signal resolves immediately now.
    tokio::time::timeout(Duration::from_millis(100), stream.closed())
        .await
        .expect("closed event");

    // Writing after close errors, reading yields 0.
    assert!(stream.write(b"x").await.is_err());
    let mut buf = [0u8; 4];
    assert_eq!(stream.read_some(&mut buf).await, 0);

    client.shutdown();
    server.shutdown();
    Ok(())
}

/// A stream whose peer vanished closes itself after the idle timeout
/// (1.5 s in the test config).
#[tokio::test]
#[serial]
async fn idle_stream_times_out_once_the_peer_is_gone() -> Result<()> {
    let server = start_node(Box::new(EchoService)).await?;
    let client = start_node(Box::new(RejectAllServices)).await?;
    let stream = client.start_stream(ECHO_SERVICE, node_ref(&server)).await?;

    // Keepalives hold the stream open while both ends live.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!stream.is_closed());

    // Silence the far side; the idle timer must fire.
    server.shutdown();
    tokio::time::timeout(Duration::from_secs(4), stream.closed())
        .await
        .expect("idle timeout should close the stream");
    assert!(stream.is_closed());

    client.shutdown();
    Ok(())
}
