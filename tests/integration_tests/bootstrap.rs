use std::{net::Ipv4Addr, time::Duration};

use anyhow::Result;
use ovlnet::{
    models::message::K,
    node::{engine::LookupOutcome, service::RejectAllServices},
};
use serial_test::serial;

use crate::integration_tests::common::{mesh, start_node, wait_until};

/// Two-node bootstrap: one ping makes both sides route each other.
#[tokio::test]
#[serial]
async fn ping_populates_both_routing_tables() -> Result<()> {
    let a = start_node(Box::new(RejectAllServices)).await?;
    let b = start_node(Box::new(RejectAllServices)).await?;

    a.ping(Ipv4Addr::LOCALHOST, b.local_port());

    let (ra, rb) = (&a, &b);
    let both = wait_until(Duration::from_millis(500), move || async move {
        ra.num_nodes().await.unwrap_or(0) == 1 && rb.num_nodes().await.unwrap_or(0) == 1
    })
    .await;
    assert!(both, "both nodes should learn each other within 500 ms");

    let nearest = a.nearest(b.local_id(), K).await?;
    assert_eq!(nearest.first().map(|n| n.id), Some(b.local_id()));
    assert_eq!(nearest.first().map(|n| n.port()), Some(b.local_port()));

    let from_b = b.nearest(a.local_id(), K).await?;
    assert_eq!(from_b.first().map(|n| n.id), Some(a.local_id()));

    a.shutdown();
    b.shutdown();
    Ok(())
}

/// Three pairwise-bootstrapped nodes: an iterative FIND_NODE converges
/// on the target's id, address and port.
#[tokio::test]
#[serial]
async fn three_node_lookup_finds_the_target() -> Result<()> {
    let a = start_node(Box::new(RejectAllServices)).await?;
    let b = start_node(Box::new(RejectAllServices)).await?;
    let c = start_node(Box::new(RejectAllServices)).await?;
    assert!(mesh(&[&a, &b, &c]).await, "mesh bootstrap failed");

    match a.find_node(c.local_id()).await? {
        LookupOutcome::Found(node) => {
            assert_eq!(node.id, c.local_id());
            assert_eq!(node.addr(), Ipv4Addr::LOCALHOST);
            assert_eq!(node.port(), c.local_port());
        },
        other => panic!("lookup failed: {other:?}"),
    }

    for n in [&a, &b, &c] {
        n.shutdown();
    }
    Ok(())
}

/// A lookup for an identifier nobody owns reports the nearest nodes it
/// saw instead of hanging.
#[tokio::test]
#[serial]
async fn lookup_for_unknown_target_reports_nearest() -> Result<()> {
    let a = start_node(Box::new(RejectAllServices)).await?;
    let b = start_node(Box::new(RejectAllServices)).await?;
    assert!(mesh(&[&a, &b]).await, "mesh bootstrap failed");

    let ghost = ovlnet::models::identifier::Identifier::random();
    match a.find_node(ghost).await? {
        LookupOutcome::NotFound(best) => {
            assert!(best.iter().any(|n| n.id == b.local_id()));
        },
        other => panic!("expected NotFound, got {other:?}"),
    }

    // The ghost never entered the routing table.
    assert!(!a.nodes().await?.iter().any(|n| n.id == ghost));

    a.shutdown();
    b.shutdown();
    Ok(())
}

/// Datagrams of the wrong shape neither crash the engine nor pollute
/// the routing table.
#[tokio::test]
#[serial]
async fn malformed_datagrams_are_ignored() -> Result<()> {
    let a = start_node(Box::new(RejectAllServices)).await?;

    let probe = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let target = (Ipv4Addr::LOCALHOST, a.local_port());
    probe.send_to(&[0u8; 5], target).await?;
    probe.send_to(&[0xffu8; 41], target).await?;
    let mut huge = vec![0u8; 1400];
    huge[20] = 0x01;
    probe.send_to(&huge, target).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.num_nodes().await?, 0);

    // The engine is still healthy enough to bootstrap.
    let b = start_node(Box::new(RejectAllServices)).await?;
    a.ping(Ipv4Addr::LOCALHOST, b.local_port());
    let ra = &a;
    assert!(
        wait_until(Duration::from_secs(2), move || async move {
            ra.num_nodes().await.unwrap_or(0) == 1
        })
        .await
    );

    a.shutdown();
    b.shutdown();
    Ok(())
}
