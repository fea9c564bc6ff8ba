/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The ordered set of sealers that vote in consensus.
//!
//! ## Order of sealers
//!
//! Sealers are kept in the order given by the [chain storage](crate::pluggables::ChainStorage). A
//! sealer's position in this order is its [`NodeIndex`], which is what protocol messages carry in
//! their `idx` field, and what leader selection rotates over.
//!
//! ## Quorum
//!
//! With `n` sealers, the set tolerates `f = (n - 1) / 3` faulty sealers, and a quorum is `n - f`
//! sealers. For the usual `n = 3f + 1` this is `2f + 1`.

use std::slice;

use ed25519_dalek::VerifyingKey;

use super::data_types::{BlockHeight, NodeIndex, ViewNumber};

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SealerSet {
    sealers: Vec<VerifyingKey>,
}

impl SealerSet {
    /// Create a sealer set from `sealers`, dropping repeated keys while preserving their first position.
    pub fn new(sealers: Vec<VerifyingKey>) -> SealerSet {
        let mut deduplicated: Vec<VerifyingKey> = Vec::with_capacity(sealers.len());
        for sealer in sealers {
            if !deduplicated.contains(&sealer) {
                deduplicated.push(sealer)
            }
        }
        SealerSet { sealers: deduplicated }
    }

    pub fn len(&self) -> usize {
        self.sealers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sealers.is_empty()
    }

    pub fn contains(&self, sealer: &VerifyingKey) -> bool {
        self.sealers.contains(sealer)
    }

    /// Get the position of `sealer` in the set, if it is a sealer.
    pub fn index_of(&self, sealer: &VerifyingKey) -> Option<NodeIndex> {
        self.sealers
            .iter()
            .position(|s| s == sealer)
            .map(|pos| NodeIndex::new(pos as u32))
    }

    /// Get the sealer at position `idx`, if there is one.
    pub fn get(&self, idx: NodeIndex) -> Option<&VerifyingKey> {
        self.sealers.get(idx.int() as usize)
    }

    pub fn iter(&self) -> slice::Iter<'_, VerifyingKey> {
        self.sealers.iter()
    }

    /// The maximum number of faulty sealers the set tolerates (`f`).
    pub fn max_faulty(&self) -> usize {
        self.sealers.len().saturating_sub(1) / 3
    }

    /// The minimum number of matching votes needed to make a decision.
    pub fn quorum(&self) -> usize {
        self.sealers.len() - self.max_faulty()
    }

    /// Get the leader of `view` for the block following `highest_height`.
    ///
    /// Returns `None` if the set is empty.
    pub fn leader(&self, view: ViewNumber, highest_height: BlockHeight) -> Option<NodeIndex> {
        if self.sealers.is_empty() {
            return None;
        }
        let n = self.sealers.len() as u64;
        let pos = (view.int() % n + highest_height.int() % n) % n;
        Some(NodeIndex::new(pos as u32))
    }

    /// Get the sealer that leads `view` after the current leader's block is finalized.
    pub fn next_leader(&self, view: ViewNumber, highest_height: BlockHeight) -> Option<NodeIndex> {
        self.leader(view, highest_height + 1)
    }
}
