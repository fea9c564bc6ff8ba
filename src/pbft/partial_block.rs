/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Partial-block mode: proposals that carry transaction hashes instead of transactions.
//!
//! When [`enable_partial_block`](crate::replica::Configuration::enable_partial_block) is set, a leader
//! broadcasts a [`PartialPrepareReq`] in place of a full [`PrepareReq`] for every non-empty block it
//! seals. Followers rebuild the block from their own transaction pools. If some transactions cannot be
//! found, the follower asks the leader for them with a [`GetMissedTxs`] request, and the leader answers
//! with a [`MissedTxs`] response.
//!
//! Since a block's hash covers only its header, and the header commits to the transactions through
//! their hashes, a block rebuilt this way has exactly the same hash as the leader's.

use std::collections::HashMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    networking::messages::PacketEnvelope,
    pluggables::TxPool,
    types::{
        block::{Block, BlockHeader, Transaction},
        data_types::{BlockHeight, CryptoHash},
    },
};

use super::messages::{PartialPrepareReq, PrepareReq};

/// Request for the transactions at `indices` of the block identified by `block_hash`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct GetMissedTxs {
    pub block_hash: CryptoHash,
    pub indices: Vec<u32>,
}

/// Response to a [`GetMissedTxs`] request, carrying `(index, transaction)` pairs.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MissedTxs {
    pub block_hash: CryptoHash,
    pub transactions: Vec<(u32, Transaction)>,
}

/// A block under reconstruction.
#[derive(Clone, Debug)]
pub(crate) struct PartialBlock {
    header: BlockHeader,
    tx_hashes: Vec<CryptoHash>,
    transactions: Vec<Option<Transaction>>,
}

impl PartialBlock {
    /// Start rebuilding the block proposed in `req` using the transactions found in `tx_pool`.
    pub(crate) fn resolve(req: &PartialPrepareReq, tx_pool: &dyn TxPool) -> PartialBlock {
        let (found, _) = tx_pool.resolve(&req.tx_hashes);
        let found: HashMap<CryptoHash, Transaction> = found.into_iter().map(|tx| (tx.hash(), tx)).collect();
        let transactions = req
            .tx_hashes
            .iter()
            .map(|tx_hash| found.get(tx_hash).cloned())
            .collect();
        PartialBlock {
            header: req.header.clone(),
            tx_hashes: req.tx_hashes.clone(),
            transactions,
        }
    }

    #[cfg(test)]
    pub(crate) fn hash(&self) -> CryptoHash {
        self.header.hash()
    }

    /// Positions of the transactions that are still missing.
    pub(crate) fn missing_indices(&self) -> Vec<u32> {
        self.transactions
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.transactions.iter().all(Option::is_some)
    }

    /// Fill in missing transactions. A transaction is accepted only if its position exists and its hash
    /// is the one the header committed to at that position.
    ///
    /// Returns the number of transactions filled in.
    pub(crate) fn fill(&mut self, transactions: &[(u32, Transaction)]) -> usize {
        let mut filled = 0;
        for (index, tx) in transactions {
            let index = *index as usize;
            match (self.tx_hashes.get(index), self.transactions.get_mut(index)) {
                (Some(expected), Some(slot)) if slot.is_none() && tx.hash() == *expected => {
                    *slot = Some(tx.clone());
                    filled += 1;
                }
                _ => log::debug!("Discarded a missed transaction at index {} that does not fit", index),
            }
        }
        filled
    }

    /// Turn the partial block into a full block, if it is complete.
    pub(crate) fn into_block(self) -> Option<Block> {
        let transactions: Option<Vec<Transaction>> = self.transactions.into_iter().collect();
        transactions.map(|transactions| Block {
            header: self.header,
            transactions,
            signatures: Vec::new(),
        })
    }
}

/// Turn `partial` into a full prepare using the transactions in `block`, if `block` is complete.
pub(crate) fn into_prepare(partial: &PartialPrepareReq, block: PartialBlock) -> Option<PrepareReq> {
    block.into_block().map(|block| PrepareReq {
        msg: partial.msg.clone(),
        block,
    })
}

/// Engine-side state of partial-block mode.
pub(crate) struct PartialPrepareCache {
    /// As leader: the full prepare behind the partial prepare last broadcast.
    pre_raw_prepare: Option<PrepareReq>,
    /// As follower: the partial prepare waiting on missing transactions.
    pending: Option<(PartialPrepareReq, PartialBlock)>,
    /// Partial prepares received from relays, waiting to be forwarded as full prepares once complete.
    forwards: HashMap<CryptoHash, (BlockHeight, PacketEnvelope)>,
    forward_height_window: u64,
}

impl PartialPrepareCache {
    pub(crate) fn new(forward_height_window: u64) -> PartialPrepareCache {
        PartialPrepareCache {
            pre_raw_prepare: None,
            pending: None,
            forwards: HashMap::new(),
            forward_height_window,
        }
    }

    /* ↓↓↓ Leader ↓↓↓ */

    pub(crate) fn set_pre_raw_prepare(&mut self, prepare: PrepareReq) {
        self.pre_raw_prepare = Some(prepare);
    }

    pub(crate) fn clear_pre_raw_prepare(&mut self) {
        self.pre_raw_prepare = None;
    }

    /// Answer `req` from the full prepare last proposed, if it is the block `req` asks about.
    pub(crate) fn fetch_missed_txs(&self, req: &GetMissedTxs) -> Option<MissedTxs> {
        let prepare = self.pre_raw_prepare.as_ref()?;
        if prepare.block_hash != req.block_hash {
            return None;
        }
        let transactions = req
            .indices
            .iter()
            .filter_map(|index| {
                prepare
                    .block
                    .transactions
                    .get(*index as usize)
                    .map(|tx| (*index, tx.clone()))
            })
            .collect();
        Some(MissedTxs {
            block_hash: req.block_hash,
            transactions,
        })
    }

    /* ↓↓↓ Follower ↓↓↓ */

    /// Hold `req` until its missing transactions arrive. Returns `false` if a partial prepare for the same
    /// block is already held.
    pub(crate) fn add_pending(&mut self, req: PartialPrepareReq, block: PartialBlock) -> bool {
        if self
            .pending
            .as_ref()
            .is_some_and(|(held, _)| held.block_hash == req.block_hash)
        {
            return false;
        }
        self.pending = Some((req, block));
        true
    }

    #[cfg(test)]
    pub(crate) fn pending_hash(&self) -> Option<CryptoHash> {
        self.pending.as_ref().map(|(req, _)| req.block_hash)
    }

    /// Fill the pending partial prepare with `missed`. Returns the full prepare once every transaction is
    /// present, releasing the pending slot.
    pub(crate) fn fill(&mut self, missed: &MissedTxs) -> Option<PrepareReq> {
        let (req, block) = self.pending.as_mut()?;
        if req.block_hash != missed.block_hash {
            return None;
        }
        block.fill(&missed.transactions);
        if !block.is_complete() {
            return None;
        }
        let (req, block) = self.pending.take()?;
        into_prepare(&req, block)
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending = None;
    }

    /* ↓↓↓ Deferred forwards ↓↓↓ */

    /// Defer forwarding the partial prepare in `envelope` until its block is complete. Deferrals that have
    /// fallen `forward_height_window` or more heights behind `highest_height` are discarded.
    pub(crate) fn add_forward(
        &mut self,
        block_hash: CryptoHash,
        height: BlockHeight,
        envelope: PacketEnvelope,
        highest_height: BlockHeight,
    ) {
        let window = self.forward_height_window;
        self.forwards
            .retain(|_, (held_height, _)| held_height.distance_below(highest_height) < window);
        self.forwards.insert(block_hash, (height, envelope));
    }

    pub(crate) fn take_forward(&mut self, block_hash: &CryptoHash) -> Option<PacketEnvelope> {
        self.forwards.remove(block_hash).map(|(_, envelope)| envelope)
    }

    pub(crate) fn clear_forwards(&mut self) {
        self.forwards.clear()
    }

    #[cfg(test)]
    pub(crate) fn forward_count(&self) -> usize {
        self.forwards.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex};

    use ed25519_dalek::{SigningKey, VerifyingKey};
    use rand_core::OsRng;

    use super::*;
    use crate::{
        networking::messages::{Packet, PacketKind},
        types::{
            crypto_primitives::Keypair,
            data_types::{NodeIndex, ViewNumber},
        },
    };

    struct FixedPool(Mutex<Vec<Transaction>>);

    impl TxPool for FixedPool {
        fn pending(&self, limit: usize, _: &HashSet<CryptoHash>) -> Vec<Transaction> {
            self.0.lock().unwrap().iter().take(limit).cloned().collect()
        }

        fn pending_count(&self) -> usize {
            self.0.lock().unwrap().len()
        }

        fn resolve(&self, hashes: &[CryptoHash]) -> (Vec<Transaction>, Vec<CryptoHash>) {
            let pool = self.0.lock().unwrap();
            let mut found = Vec::new();
            let mut missing = Vec::new();
            for tx_hash in hashes {
                match pool.iter().find(|tx| tx.hash() == *tx_hash) {
                    Some(tx) => found.push(tx.clone()),
                    None => missing.push(*tx_hash),
                }
            }
            (found, missing)
        }

        fn drop_committed(&self, _: &Block) {}

        fn handle_bad_block(&self, _: &Block) {}
    }

    fn keypair() -> Keypair {
        let mut csprg = OsRng {};
        Keypair::new(SigningKey::generate(&mut csprg))
    }

    fn transactions() -> Vec<Transaction> {
        (0..5u8).map(|i| Transaction::new(vec![i; 8])).collect()
    }

    fn prepare(keypair: &Keypair) -> PrepareReq {
        let block = Block::new(
            BlockHeight::new(1),
            Block::genesis().hash(),
            NodeIndex::new(0),
            1,
            transactions(),
        );
        PrepareReq::new(keypair, ViewNumber::new(0), NodeIndex::new(0), block)
    }

    #[test]
    fn rebuild_with_missed_txs_test() {
        // 1. The leader proposes a block of 5 transactions, and keeps the full prepare.
        let leader = keypair();
        let full = prepare(&leader);
        let partial = PartialPrepareReq::from_prepare(&full);
        let mut leader_cache = PartialPrepareCache::new(10);
        leader_cache.set_pre_raw_prepare(full.clone());

        // 2. The follower has 3 of the 5 transactions.
        let txs = transactions();
        let pool = FixedPool(Mutex::new(vec![txs[0].clone(), txs[2].clone(), txs[4].clone()]));
        let block = PartialBlock::resolve(&partial, &pool);
        assert!(!block.is_complete());
        assert_eq!(block.missing_indices(), vec![1, 3]);
        assert_eq!(block.hash(), full.block_hash);

        // 3. The follower holds the partial prepare. A second copy is rejected.
        let mut follower_cache = PartialPrepareCache::new(10);
        assert!(follower_cache.add_pending(partial.clone(), block.clone()));
        assert!(!follower_cache.add_pending(partial.clone(), block.clone()));

        // 4. The leader answers the request for the missing transactions.
        let missed = leader_cache
            .fetch_missed_txs(&GetMissedTxs {
                block_hash: full.block_hash,
                indices: block.missing_indices(),
            })
            .unwrap();
        assert_eq!(missed.transactions.len(), 2);

        // 5. The follower rebuilds the exact prepare the leader proposed.
        let rebuilt = follower_cache.fill(&missed).unwrap();
        assert_eq!(rebuilt, full);
        assert!(rebuilt.is_correctly_signed(&leader.public()));
        assert_eq!(follower_cache.pending_hash(), None);
    }

    #[test]
    fn fill_rejects_wrong_transactions_test() {
        let full = prepare(&keypair());
        let partial = PartialPrepareReq::from_prepare(&full);
        let pool = FixedPool(Mutex::new(Vec::new()));
        let mut block = PartialBlock::resolve(&partial, &pool);

        let txs = transactions();
        let filled = block.fill(&[
            (0, txs[1].clone()),
            (9, txs[0].clone()),
            (1, txs[1].clone()),
        ]);
        assert_eq!(filled, 1);
        assert_eq!(block.missing_indices(), vec![0, 2, 3, 4]);
        assert!(block.into_block().is_none());
    }

    #[test]
    fn fetch_missed_txs_only_answers_for_the_proposed_block_test() {
        let full = prepare(&keypair());
        let mut cache = PartialPrepareCache::new(10);
        let req = GetMissedTxs {
            block_hash: full.block_hash,
            indices: vec![0, 7],
        };
        assert!(cache.fetch_missed_txs(&req).is_none());

        cache.set_pre_raw_prepare(full.clone());
        assert_eq!(cache.fetch_missed_txs(&req).unwrap().transactions.len(), 1);

        let other = GetMissedTxs {
            block_hash: CryptoHash::zero(),
            indices: vec![0],
        };
        assert!(cache.fetch_missed_txs(&other).is_none());

        cache.clear_pre_raw_prepare();
        assert!(cache.fetch_missed_txs(&req).is_none());
    }

    #[test]
    fn deferred_forwards_are_bounded_by_height_test() {
        let mut csprg = OsRng {};
        let sender: VerifyingKey = SigningKey::generate(&mut csprg).verifying_key();
        let envelope = PacketEnvelope {
            packet: Packet::new(PacketKind::PartialPrepareReq, 3, vec![], None),
            sender,
            sender_index: NodeIndex::new(0),
            sender_endpoint: String::from("127.0.0.1:30300"),
        };
        let mut cache = PartialPrepareCache::new(10);
        let old = CryptoHash::new([1u8; 32]);
        let recent = CryptoHash::new([2u8; 32]);

        cache.add_forward(old, BlockHeight::new(5), envelope.clone(), BlockHeight::new(5));
        cache.add_forward(recent, BlockHeight::new(14), envelope.clone(), BlockHeight::new(14));
        assert_eq!(cache.forward_count(), 2);

        // Height 5 is 10 heights behind 15, so it is discarded when the next deferral is added.
        cache.add_forward(CryptoHash::new([3u8; 32]), BlockHeight::new(16), envelope, BlockHeight::new(15));
        assert_eq!(cache.forward_count(), 2);
        assert!(cache.take_forward(&old).is_none());
        assert!(cache.take_forward(&recent).is_some());

        cache.clear_forwards();
        assert_eq!(cache.forward_count(), 0);
    }
}
