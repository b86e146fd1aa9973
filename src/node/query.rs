// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! State of one iterative lookup.
//!
//! `best` is the sorted-by-distance list of the up-to-K closest
//! candidates seen so far; `queried` remembers who was already asked.
//! The lookup makes progress by always querying the nearest entry of
//! `best` that has not been asked yet, and converges once no such entry
//! remains.

use std::collections::HashSet;

use crate::models::{identifier::Identifier, message::K, peer::Node};

#[derive(Debug)]
pub struct SearchQuery {
    target: Identifier,
    best: Vec<Node>,
    queried: HashSet<Identifier>,
}

impl SearchQuery {
    pub fn new(target: Identifier) -> Self {
        SearchQuery {
            target,
            best: Vec::with_capacity(K + 1),
            queried: HashSet::new(),
        }
    }

    pub fn target(&self) -> &Identifier {
        &self.target
    }

    /// Seeds the candidate list, typically with the own routing
    /// table's nearest-K.
    pub fn seed(&mut self, nodes: Vec<Node>) {
        for node in nodes {
            self.update(node);
        }
    }

    /// Merges a discovered node into `best`, keeping the list sorted by
    /// XOR distance to the target and bounded by K. Nodes already
    /// queried or already listed are ignored.
    pub fn update(&mut self, node: Node) {
        if self.queried.contains(&node.id) {
            return;
        }
        let d = self.target.distance(&node.id);
        let mut at = self.best.len();
        for (i, candidate) in self.best.iter().enumerate() {
            if candidate.id == node.id {
                return;
            }
            if d < self.target.distance(&candidate.id) {
                at = i;
                break;
            }
        }
        self.best.insert(at, node);
        self.best.truncate(K);
    }

    /// The nearest not-yet-queried candidate, marking it queried.
    pub fn next(&mut self) -> Option<Node> {
        let node = *self
            .best
            .iter()
            .find(|n| !self.queried.contains(&n.id))?;
        self.queried.insert(node.id);
        Some(node)
    }

    pub fn best(&self) -> &[Node] {
        &self.best
    }

    /// For FIND_NODE: the lookup succeeded once the nearest candidate
    /// is the target itself.
    pub fn found(&self) -> bool {
        self.best
            .first()
            .is_some_and(|n| n.id == self.target)
    }

    pub fn first(&self) -> Option<&Node> {
        self.best.first()
    }
}
