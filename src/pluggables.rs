/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for the collaborators that the consensus engine drives but does not implement.
//!
//! A replica needs four collaborators besides its [network](crate::networking::network::Network) and
//! [backup store](crate::backup::pluggables::KVStore):
//! 1. An [`Executor`], which executes candidate blocks.
//! 2. A [`ChainStorage`], which holds the finalized chain and the current sealer set.
//! 3. A [`TxPool`], which supplies transactions to seal and resolves transaction hashes in
//!    [partial prepares](crate::pbft::partial_block).
//! 4. A [`BlockSync`], which catches the replica up when it falls behind.
//!
//! All of them are called from the consensus worker thread, except [`TxPool::resolve`], which is also
//! called from the poller thread. Implementations should return quickly: a slow collaborator stalls
//! consensus.

use std::{any::Any, collections::HashSet, fmt, sync::Arc};

use crate::types::{
    block::{Block, Transaction},
    data_types::{BlockHeight, CryptoHash},
    sealer_set::SealerSet,
};

/// Executes candidate blocks.
///
/// `execute` is called at most once for every accepted prepare, so implementations need not be
/// idempotent.
pub trait Executor: Send {
    fn execute(&mut self, block: &Block) -> Result<ExecutionResult, ExecutionError>;
}

/// The outcome of executing a block.
pub struct ExecutionResult {
    /// State root that the executed block's header commits to.
    pub state_root: CryptoHash,
    /// Handle passed back to [`ChainStorage::append`] if the block is finalized.
    pub context: ExecutionContext,
}

/// Opaque handle over whatever an [`Executor`] needs to persist the effects of an executed block.
#[derive(Clone)]
pub struct ExecutionContext(Arc<dyn Any + Send + Sync>);

impl ExecutionContext {
    pub fn new<T: Any + Send + Sync>(context: T) -> Self {
        Self(Arc::new(context))
    }

    /// Get the handle as a `T`, if that is what it holds.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

#[derive(Debug)]
pub struct ExecutionError(pub String);

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution failed: {}", self.0)
    }
}

/// Finalized chain storage.
pub trait ChainStorage: Send {
    /// Height of the highest finalized block.
    fn current_height(&self) -> BlockHeight;

    fn block_at(&self, height: BlockHeight) -> Option<Block>;

    /// Append a finalized `block` along with the `context` its execution produced.
    fn append(&mut self, block: Block, context: ExecutionContext) -> CommitResult;

    /// The sealer set in effect after the highest finalized block.
    fn sealer_set(&self) -> SealerSet;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitResult {
    Ok,
    /// Another block was already appended at this height.
    Conflict,
    Failure,
}

/// Transaction pool, shared between the consensus worker and the poller thread.
pub trait TxPool: Send + Sync {
    /// Get up to `limit` pending transactions, skipping those whose hash is in `exclude`.
    fn pending(&self, limit: usize, exclude: &HashSet<CryptoHash>) -> Vec<Transaction>;

    /// Number of pending transactions.
    fn pending_count(&self) -> usize;

    /// Look up `hashes`. Returns the transactions found and the hashes that were not.
    fn resolve(&self, hashes: &[CryptoHash]) -> (Vec<Transaction>, Vec<CryptoHash>);

    /// Remove the transactions of a finalized `block`.
    fn drop_committed(&self, block: &Block);

    /// Called with a block that a quorum agreed on but the chain storage refused.
    fn handle_bad_block(&self, block: &Block);
}

/// Block synchronization.
pub trait BlockSync: Send {
    /// Inform block sync of the height the engine is currently working on.
    fn note_sealing_height(&mut self, height: BlockHeight);

    fn is_syncing(&self) -> bool;

    /// Highest block height known among peers.
    fn known_highest(&self) -> BlockHeight;
}
