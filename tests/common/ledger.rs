//! Simple in-memory implementations of the collaborators a replica drives: a ledger of finalized blocks,
//! an executor over it, a transaction pool, and a block sync that never syncs.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use borsh::BorshSerialize;
use pbft_rs::{
    pluggables::{
        BlockSync, ChainStorage, CommitResult, ExecutionContext, ExecutionError, ExecutionResult, Executor, TxPool,
    },
    types::{
        block::{Block, Transaction},
        crypto_primitives::hash,
        data_types::{BlockHeight, CryptoHash},
        sealer_set::SealerSet,
    },
};

/// Executes blocks by hashing their contents. The resulting state root ignores the header's own state root,
/// so executing a block twice gives the same result.
pub(crate) struct HashExecutor;

impl Executor for HashExecutor {
    fn execute(&mut self, block: &Block) -> Result<ExecutionResult, ExecutionError> {
        let bytes = (block.header.height, block.header.parent_hash, block.header.transactions_root)
            .try_to_vec()
            .map_err(|err| ExecutionError(err.to_string()))?;
        Ok(ExecutionResult {
            state_root: hash(&bytes),
            context: ExecutionContext::new(block.height()),
        })
    }
}

/// A chain of finalized blocks that starts at the genesis block.
#[derive(Clone)]
pub(crate) struct Ledger {
    blocks: Arc<Mutex<Vec<Block>>>,
    sealer_set: SealerSet,
}

impl Ledger {
    pub(crate) fn new(sealer_set: SealerSet) -> Ledger {
        Ledger {
            blocks: Arc::new(Mutex::new(vec![Block::genesis()])),
            sealer_set,
        }
    }

    pub(crate) fn height(&self) -> BlockHeight {
        self.current_height()
    }

    pub(crate) fn hashes(&self) -> Vec<CryptoHash> {
        self.blocks.lock().unwrap().iter().map(|block| block.hash()).collect()
    }

    /// Every transaction in the chain, in order.
    pub(crate) fn transactions(&self) -> Vec<Transaction> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .flat_map(|block| block.transactions.clone())
            .collect()
    }

    pub(crate) fn signature_counts(&self) -> Vec<usize> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .skip(1)
            .map(|block| block.signatures.len())
            .collect()
    }
}

impl ChainStorage for Ledger {
    fn current_height(&self) -> BlockHeight {
        BlockHeight::new(self.blocks.lock().unwrap().len() as u64 - 1)
    }

    fn block_at(&self, height: BlockHeight) -> Option<Block> {
        self.blocks.lock().unwrap().get(height.int() as usize).cloned()
    }

    fn append(&mut self, block: Block, _: ExecutionContext) -> CommitResult {
        let mut blocks = self.blocks.lock().unwrap();
        if block.height().int() as usize != blocks.len() {
            return CommitResult::Conflict;
        }
        blocks.push(block);
        CommitResult::Ok
    }

    fn sealer_set(&self) -> SealerSet {
        self.sealer_set.clone()
    }
}

/// A pool of pending transactions, kept in submission order.
pub(crate) struct MemTxPool {
    transactions: Mutex<Vec<Transaction>>,
}

impl MemTxPool {
    pub(crate) fn new() -> Arc<MemTxPool> {
        Arc::new(MemTxPool {
            transactions: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn submit(&self, transaction: Transaction) {
        self.transactions.lock().unwrap().push(transaction);
    }
}

impl TxPool for MemTxPool {
    fn pending(&self, limit: usize, exclude: &HashSet<CryptoHash>) -> Vec<Transaction> {
        self.transactions
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !exclude.contains(&tx.hash()))
            .take(limit)
            .cloned()
            .collect()
    }

    fn pending_count(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    fn resolve(&self, hashes: &[CryptoHash]) -> (Vec<Transaction>, Vec<CryptoHash>) {
        let transactions = self.transactions.lock().unwrap();
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for tx_hash in hashes {
            match transactions.iter().find(|tx| tx.hash() == *tx_hash) {
                Some(tx) => found.push(tx.clone()),
                None => missing.push(*tx_hash),
            }
        }
        (found, missing)
    }

    fn drop_committed(&self, block: &Block) {
        self.transactions
            .lock()
            .unwrap()
            .retain(|tx| !block.transactions.contains(tx));
    }

    fn handle_bad_block(&self, block: &Block) {
        log::warn!("Chain refused block at height {}", block.height());
    }
}

pub(crate) struct NoSync;

impl BlockSync for NoSync {
    fn note_sealing_height(&mut self, _: BlockHeight) {}

    fn is_syncing(&self) -> bool {
        false
    }

    fn known_highest(&self) -> BlockHeight {
        BlockHeight::new(0)
    }
}
