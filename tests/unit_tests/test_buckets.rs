use std::{net::Ipv4Addr, time::Duration};

use ovlnet::{
    buckets::Buckets,
    models::{
        identifier::{HASH_SIZE, Identifier},
        message::K,
        peer::Peer,
    },
};

fn peer(port: u16) -> Peer {
    Peer::new(Ipv4Addr::LOCALHOST, port)
}

/// Identifier whose distance to `myself` leads at exactly `prefix`.
fn id_at_prefix(myself: &Identifier, prefix: usize) -> Identifier {
    let mut bytes = *myself.as_bytes();
    bytes[prefix / 8] ^= 0x80 >> (prefix % 8);
    for b in bytes.iter_mut().skip(prefix / 8 + 1) {
        *b ^= rand::random::<u8>();
    }
    Identifier::from_bytes(bytes)
}

#[test]
fn repeated_adds_respect_the_k_bound_per_neighborhood() {
    let myself = Identifier::ZERO;
    let mut buckets = Buckets::new(myself);
    // All of these share prefix 0 (MSB differs), so they compete for
    // one bucket: after it splits once, the far side stays capped.
    let mut inserted = 0;
    for i in 0..(4 * K) {
        if buckets.add(id_at_prefix(&myself, 0), peer(i as u16)) {
            inserted += 1;
        }
    }
    assert_eq!(inserted, K);
    assert_eq!(buckets.num_nodes(), K);
}

#[test]
fn rejection_preserves_existing_entries() {
    let myself = Identifier::ZERO;
    let mut buckets = Buckets::new(myself);
    let residents: Vec<Identifier> =
        (0..K).map(|i| {
            let id = id_at_prefix(&myself, 0);
            assert!(buckets.add(id, peer(i as u16)));
            id
        }).collect();

    for _ in 0..20 {
        buckets.add(id_at_prefix(&myself, 0), peer(999));
    }
    for id in &residents {
        assert!(buckets.contains(id), "resident evicted by rejected insert");
    }
}

#[test]
fn fresh_entries_survive_remove_older_than() {
    let mut buckets = Buckets::new(Identifier::random());
    for i in 0..50u16 {
        buckets.add(Identifier::random(), peer(i));
    }
    let before = buckets.num_nodes();
    buckets.remove_older_than(Duration::from_secs(15 * 60));
    assert_eq!(buckets.num_nodes(), before);
    assert!(buckets.older_than(Duration::from_secs(15 * 60)).is_empty());
}

#[test]
fn nearest_matches_brute_force() {
    let myself = Identifier::random();
    let mut buckets = Buckets::new(myself);
    let mut all: Vec<Identifier> = Vec::new();
    for i in 0..200u16 {
        let id = Identifier::random();
        if buckets.add(id, peer(i)) {
            all.push(id);
        }
    }
    let target = Identifier::random();
    let best = buckets.nearest(&target, K);
    assert_eq!(best.len(), K.min(all.len()));

    let mut brute: Vec<Identifier> = buckets.nodes().iter().map(|n| n.id).collect();
    brute.sort_by_key(|id| target.distance(id));
    for (got, want) in best.iter().zip(brute.iter()) {
        assert_eq!(
            target.distance(&got.id),
            target.distance(want),
            "nearest-k disagrees with exhaustive sort"
        );
    }
}

#[test]
fn get_returns_the_latest_endpoint() {
    let mut buckets = Buckets::new(Identifier::random());
    let id = Identifier::random();
    buckets.add(id, peer(1000));
    buckets.add(id, peer(2000));
    assert_eq!(buckets.get(&id).map(|n| n.port()), Some(2000));
    assert_eq!(buckets.get(&Identifier::random()), None);
}

#[test]
fn splits_keep_every_close_node_reachable() {
    let myself = Identifier::ZERO;
    let mut buckets = Buckets::new(myself);
    let mut kept: Vec<Identifier> = Vec::new();
    // Walk prefixes inward, forcing a cascade of splits.
    for prefix in 0..(2 * HASH_SIZE) {
        for _ in 0..2 {
            let id = id_at_prefix(&myself, prefix);
            if buckets.add(id, peer(prefix as u16)) {
                kept.push(id);
            }
        }
    }
    for id in &kept {
        assert!(buckets.contains(id), "entry lost across splits");
    }
    assert_eq!(buckets.num_nodes(), kept.len());
}
