/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [`Block`] type and its parts.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::{hash, CryptoHasher, Digest},
    data_types::{BlockHeight, CryptoHash, NodeIndex, SignatureBytes},
};

/// An opaque transaction. Its meaning is defined by the [executor](crate::pluggables::Executor).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transaction(Vec<u8>);

impl Transaction {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &Vec<u8> {
        &self.0
    }

    pub fn hash(&self) -> CryptoHash {
        hash(&self.0)
    }
}

/// The signed part of a block.
///
/// The hash of a block is the hash of its header. The header commits to the block's transactions
/// through `transactions_root`, and to the result of executing them through `state_root`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockHeader {
    pub height: BlockHeight,
    pub parent_hash: CryptoHash,
    pub sealer: NodeIndex,
    pub timestamp: u64,
    pub transactions_root: CryptoHash,
    pub state_root: CryptoHash,
}

impl BlockHeader {
    pub fn hash(&self) -> CryptoHash {
        // Safety: serializing a header into memory cannot fail.
        hash(&self.try_to_vec().unwrap())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Sign requests of a quorum of sealers, attached when the block is finalized.
    pub signatures: Vec<(NodeIndex, SignatureBytes)>,
}

impl Block {
    /// Create a new, unexecuted block.
    pub fn new(
        height: BlockHeight,
        parent_hash: CryptoHash,
        sealer: NodeIndex,
        timestamp: u64,
        transactions: Vec<Transaction>,
    ) -> Block {
        let tx_hashes: Vec<CryptoHash> = transactions.iter().map(|tx| tx.hash()).collect();
        Block {
            header: BlockHeader {
                height,
                parent_hash,
                sealer,
                timestamp,
                transactions_root: Block::transactions_root(&tx_hashes),
                state_root: CryptoHash::zero(),
            },
            transactions,
            signatures: Vec::new(),
        }
    }

    /// The block at height 0.
    pub fn genesis() -> Block {
        Block::new(
            BlockHeight::new(0),
            CryptoHash::zero(),
            NodeIndex::new(0),
            0,
            Vec::new(),
        )
    }

    pub fn hash(&self) -> CryptoHash {
        self.header.hash()
    }

    pub fn height(&self) -> BlockHeight {
        self.header.height
    }

    pub fn tx_hashes(&self) -> Vec<CryptoHash> {
        self.transactions.iter().map(|tx| tx.hash()).collect()
    }

    /// Hash over the concatenation of `tx_hashes`.
    pub fn transactions_root(tx_hashes: &[CryptoHash]) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        for tx_hash in tx_hashes {
            hasher.update(tx_hash.bytes());
        }
        CryptoHash::new(hasher.finalize().into())
    }

    /// Check whether the header's `transactions_root` matches the transactions the block carries.
    pub fn is_transactions_root_correct(&self) -> bool {
        self.header.transactions_root == Block::transactions_root(&self.tx_hashes())
    }
}
