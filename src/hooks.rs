/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Lifecycle hooks through which the engine informs the component that embeds it.
//!
//! Unlike [event handlers](crate::events), hooks are called synchronously on the consensus worker thread,
//! at the moment the engine makes the corresponding decision. They must return quickly.

use std::collections::HashSet;

use crate::{
    pbft::implementation::FatalError,
    types::data_types::{BlockHeight, CryptoHash},
};

/// Called after a block is appended to the chain, with its height, its number of transactions, and the
/// backoff cycle the replica was in.
pub type CommitBlockHook = Box<dyn Fn(BlockHeight, usize, u32) + Send>;

/// Called when the view times out while a proposal is pending, with the number of transactions pending in
/// the pool.
pub type ConsensusTimeoutHook = Box<dyn Fn(usize) + Send>;

/// Called whenever the replica times out and broadcasts a view change.
pub type ViewChangeHook = Box<dyn Fn() + Send>;

/// Called on the next leader when the current leader's block has been executed, with the hashes of the
/// transactions in that block. The next leader should leave them out of its own block.
pub type NextLeaderNotifyHook = Box<dyn Fn(&HashSet<CryptoHash>) + Send>;

/// Called once if the engine stops because of a [`FatalError`].
pub type FatalHook = Box<dyn Fn(&FatalError) + Send>;

#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) on_commit_block: Option<CommitBlockHook>,
    pub(crate) on_consensus_timeout: Option<ConsensusTimeoutHook>,
    pub(crate) on_view_change: Option<ViewChangeHook>,
    pub(crate) on_next_leader_notify: Option<NextLeaderNotifyHook>,
    pub(crate) on_fatal: Option<FatalHook>,
}

impl Hooks {
    pub(crate) fn commit_block(&self, height: BlockHeight, tx_count: usize, change_cycle: u32) {
        if let Some(hook) = &self.on_commit_block {
            hook(height, tx_count, change_cycle)
        }
    }

    pub(crate) fn consensus_timeout(&self, pending_tx_count: usize) {
        if let Some(hook) = &self.on_consensus_timeout {
            hook(pending_tx_count)
        }
    }

    pub(crate) fn view_change(&self) {
        if let Some(hook) = &self.on_view_change {
            hook()
        }
    }

    pub(crate) fn next_leader_notify(&self, tx_hash_filter: &HashSet<CryptoHash>) {
        if let Some(hook) = &self.on_next_leader_notify {
            hook(tx_hash_filter)
        }
    }

    pub(crate) fn fatal(&self, err: &FatalError) {
        if let Some(hook) = &self.on_fatal {
            hook(err)
        }
    }
}
