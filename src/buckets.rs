// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The k-bucket routing table.
//!
//! Known peers live in an ordered list of buckets; a bucket's `prefix`
//! is the smallest leading-bit index (of the XOR distance to the own
//! identifier) an entry of that bucket may have, so later buckets hold
//! closer nodes. Only the last bucket splits. Entries carry the time
//! they were last heard from; candidate entries inserted provisionally
//! have no timestamp and age out unless they are confirmed by a reply.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::models::{
    identifier::{Distance, Identifier},
    message::K,
    peer::{Node, Peer},
};

#[derive(Debug, Clone)]
struct Entry {
    peer: Peer,
    /// Leading-bit index of the distance to the own identifier.
    prefix: usize,
    /// `None` marks a provisional (unconfirmed) entry.
    last_seen: Option<Instant>,
}

impl Entry {
    fn older_than(&self, age: Duration) -> bool {
        match self.last_seen {
            Some(at) => at.elapsed() > age,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    prefix: usize,
    entries: HashMap<Identifier, Entry>,
}

impl Bucket {
    fn new(prefix: usize) -> Self {
        Bucket {
            prefix,
            entries: HashMap::with_capacity(K),
        }
    }

    fn full(&self) -> bool {
        self.entries.len() >= K
    }

    fn contains(&self, id: &Identifier) -> bool {
        self.entries.contains_key(id)
    }

    /// Inserts or refreshes an entry. Returns `true` for a new entry.
    fn add(&mut self, id: Identifier, peer: Peer, prefix: usize) -> bool {
        let is_new = !self.contains(&id);
        if !is_new || !self.full() {
            self.entries.insert(
                id,
                Entry {
                    peer,
                    prefix,
                    last_seen: Some(Instant::now()),
                },
            );
            return is_new;
        }
        false
    }

    /// Inserts a provisional entry without a timestamp; it will be
    /// pinged and either confirmed or aged out by the node timer.
    fn add_candidate(&mut self, id: Identifier, peer: Peer, prefix: usize) {
        if !self.contains(&id) && !self.full() {
            self.entries.insert(
                id,
                Entry {
                    peer,
                    prefix,
                    last_seen: None,
                },
            );
        }
    }

    /// Moves every entry whose prefix exceeds this bucket's prefix into
    /// a freshly appended bucket covering `prefix + 1`.
    fn split(&mut self) -> Bucket {
        let mut next = Bucket::new(self.prefix + 1);
        let own_prefix = self.prefix;
        let moved: Vec<Identifier> = self
            .entries
            .iter()
            .filter(|(_, e)| e.prefix > own_prefix)
            .map(|(id, _)| *id)
            .collect();
        for id in moved {
            if let Some(entry) = self.entries.remove(&id) {
                next.entries.insert(id, entry);
            }
        }
        next
    }

    /// Insorts this bucket's entries into `best`, keeping it sorted by
    /// distance to `target` and no longer than `k`.
    fn collect_nearest(&self, target: &Identifier, best: &mut Vec<Node>, k: usize) {
        for (id, entry) in &self.entries {
            let d = target.distance(id);
            let at = best
                .iter()
                .position(|n| d < target.distance(&n.id))
                .unwrap_or(best.len());
            best.insert(at, Node { id: *id, peer: entry.peer });
            best.truncate(k);
        }
    }
}

/// The ordered list of buckets of one node.
#[derive(Debug)]
pub struct Buckets {
    myself: Identifier,
    buckets: Vec<Bucket>,
}

impl Buckets {
    pub fn new(myself: Identifier) -> Self {
        Buckets {
            myself,
            buckets: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() || self.num_nodes() == 0
    }

    pub fn num_nodes(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| {
                b.entries
                    .iter()
                    .map(|(id, e)| Node { id: *id, peer: e.peer })
            })
            .collect()
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.buckets.iter().any(|b| b.contains(id))
    }

    pub fn get(&self, id: &Identifier) -> Option<Node> {
        self.buckets.iter().find_map(|b| {
            b.entries.get(id).map(|e| Node { id: *id, peer: e.peer })
        })
    }

    /// Index of the bucket an identifier belongs into: the last bucket
    /// whose prefix does not exceed the identifier's leading distance
    /// bit.
    fn index_for(&self, prefix: usize) -> usize {
        if self.buckets.len() < 2 {
            return 0;
        }
        for i in 0..self.buckets.len() - 1 {
            if self.buckets[i].prefix == prefix {
                return i;
            }
            if self.buckets[i + 1].prefix > prefix {
                return i;
            }
        }
        self.buckets.len() - 1
    }

    /// Adds or refreshes a node. Returns `true` if it was newly
    /// inserted, `false` on update or rejection. The own identifier is
    /// never inserted; a full unsplittable bucket rejects and keeps its
    /// existing entries.
    pub fn add(&mut self, id: Identifier, peer: Peer) -> bool {
        self.insert(id, peer, false)
    }

    /// Adds a provisional entry (see [`Bucket::add_candidate`]).
    pub fn add_candidate(&mut self, id: Identifier, peer: Peer) {
        self.insert(id, peer, true);
    }

    fn insert(&mut self, id: Identifier, peer: Peer, provisional: bool) -> bool {
        if id == self.myself {
            return false;
        }
        let prefix = id.distance(&self.myself).leading_bit();
        if self.buckets.is_empty() {
            self.buckets.push(Bucket::new(0));
        }
        let at = self.index_for(prefix);
        let bucket = &mut self.buckets[at];
        if bucket.contains(&id) || !bucket.full() {
            if provisional {
                bucket.add_candidate(id, peer, prefix);
                return false;
            }
            return bucket.add(id, peer, prefix);
        }
        if at + 1 == self.buckets.len() {
            // Only the last bucket splits; then retry in the refined table.
            let next = self.buckets[at].split();
            self.buckets.push(next);
            return self.insert(id, peer, provisional);
        }
        false
    }

    /// The `k` known nodes nearest to `target`, sorted by XOR distance.
    pub fn nearest(&self, target: &Identifier, k: usize) -> Vec<Node> {
        let mut best = Vec::with_capacity(k + 1);
        for bucket in &self.buckets {
            bucket.collect_nearest(target, &mut best, k);
        }
        best
    }

    /// Distance from `target` to the most distant of the K nearest
    /// known nodes, if any node is known at all.
    pub fn furthest_of_nearest(&self, target: &Identifier) -> Option<Distance> {
        self.nearest(target, K)
            .last()
            .map(|n| target.distance(&n.id))
    }

    /// All entries not heard from within `age` (provisional entries
    /// always qualify).
    pub fn older_than(&self, age: Duration) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| {
                b.entries
                    .iter()
                    .filter(move |(_, e)| e.older_than(age))
                    .map(|(id, e)| Node { id: *id, peer: e.peer })
            })
            .collect()
    }

    pub fn remove_older_than(&mut self, age: Duration) {
        for bucket in &mut self.buckets {
            bucket.entries.retain(|id, e| {
                let keep = !e.older_than(age);
                if !keep {
                    debug!(id = %id, addr = %e.peer.addr, port = e.peer.port,
                           "lost contact, dropping node");
                }
                keep
            });
        }
    }
}
