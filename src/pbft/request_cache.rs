/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-replica store of the protocol messages that are in flight.
//!
//! The [`RequestCache`] holds, for the height being agreed on:
//! - the `raw_prepare`, i.e., the proposal as received from the leader,
//! - the `prepare`, i.e., the locally executed and re-signed version of the `raw_prepare`. Sign and
//!   commit requests reference the hash of this version,
//! - the sign and commit pools, keyed by block hash and then by signer,
//!
//! and across heights:
//! - the view change pool, keyed by requested view and then by signer,
//! - the `committed_prepare`, the last prepare that reached a quorum of signs,
//! - prepares for heights the replica cannot process yet ("future prepares").
//!
//! Every `add_*` method rejects a second message from the same signer for the same key.

use std::collections::{BTreeMap, HashMap};

use crate::{
    pluggables::ExecutionContext,
    types::{
        block::BlockHeader,
        data_types::{BlockHeight, CryptoHash, NodeIndex, SignatureBytes, ViewNumber},
    },
};

use super::messages::{CommitReq, PrepareReq, SignReq, ViewChangeReq};

/// A prepare that has been executed locally, along with the context its execution produced.
#[derive(Clone)]
pub(crate) struct ExecutedPrepare {
    pub(crate) req: PrepareReq,
    pub(crate) context: ExecutionContext,
}

pub(crate) struct RequestCache {
    raw_prepare: Option<PrepareReq>,
    prepare: Option<ExecutedPrepare>,
    committed_prepare: Option<PrepareReq>,
    sign_pool: HashMap<CryptoHash, HashMap<NodeIndex, SignReq>>,
    commit_pool: HashMap<CryptoHash, HashMap<NodeIndex, CommitReq>>,
    view_change_pool: BTreeMap<ViewNumber, HashMap<NodeIndex, ViewChangeReq>>,
    future_prepares: BTreeMap<BlockHeight, PrepareReq>,
}

impl RequestCache {
    pub(crate) fn new() -> RequestCache {
        RequestCache {
            raw_prepare: None,
            prepare: None,
            committed_prepare: None,
            sign_pool: HashMap::new(),
            commit_pool: HashMap::new(),
            view_change_pool: BTreeMap::new(),
            future_prepares: BTreeMap::new(),
        }
    }

    /* ↓↓↓ Prepares ↓↓↓ */

    pub(crate) fn raw_prepare(&self) -> Option<&PrepareReq> {
        self.raw_prepare.as_ref()
    }

    pub(crate) fn prepare(&self) -> Option<&ExecutedPrepare> {
        self.prepare.as_ref()
    }

    pub(crate) fn committed_prepare(&self) -> Option<&PrepareReq> {
        self.committed_prepare.as_ref()
    }

    /// Check whether a raw prepare for `height` and `view` has already been accepted, whatever its hash.
    pub(crate) fn is_existing_prepare(&self, height: BlockHeight, view: ViewNumber) -> bool {
        self.raw_prepare
            .as_ref()
            .is_some_and(|raw| raw.height == height && raw.view == view)
    }

    /// Accept `req` as the proposal for its height and view. A prepare for a height and view that already
    /// has one is rejected, not overwritten.
    pub(crate) fn add_raw_prepare(&mut self, req: PrepareReq) -> bool {
        if self.is_existing_prepare(req.height, req.view) {
            return false;
        }
        self.raw_prepare = Some(req);
        true
    }

    /// Store the executed version of the raw prepare. Signs and commits for the same hash that were
    /// collected under another view are discarded.
    pub(crate) fn add_prepare(&mut self, prepare: ExecutedPrepare) {
        let hash = prepare.req.block_hash;
        let view = prepare.req.view;
        if let Some(signs) = self.sign_pool.get_mut(&hash) {
            signs.retain(|_, sign| sign.view == view);
        }
        if let Some(commits) = self.commit_pool.get_mut(&hash) {
            commits.retain(|_, commit| commit.view == view);
        }
        self.prepare = Some(prepare);
    }

    /// Snapshot the executed prepare as the committed prepare, returning it.
    pub(crate) fn mark_committed(&mut self) -> Option<&PrepareReq> {
        self.committed_prepare = self.prepare.as_ref().map(|prepare| prepare.req.clone());
        self.committed_prepare.as_ref()
    }

    /// Restore a committed prepare read back from the backup store.
    pub(crate) fn set_committed_prepare(&mut self, req: PrepareReq) {
        self.committed_prepare = Some(req);
    }

    /* ↓↓↓ Signs and commits ↓↓↓ */

    pub(crate) fn is_existing_sign(&self, req: &SignReq) -> bool {
        self.sign_pool
            .get(&req.block_hash)
            .is_some_and(|signs| signs.contains_key(&req.idx))
    }

    pub(crate) fn add_sign(&mut self, req: SignReq) -> bool {
        let signs = self.sign_pool.entry(req.block_hash).or_default();
        if signs.contains_key(&req.idx) {
            return false;
        }
        signs.insert(req.idx, req);
        true
    }

    pub(crate) fn sign_count(&self, hash: &CryptoHash) -> usize {
        self.sign_pool.get(hash).map_or(0, |signs| signs.len())
    }

    pub(crate) fn is_existing_commit(&self, req: &CommitReq) -> bool {
        self.commit_pool
            .get(&req.block_hash)
            .is_some_and(|commits| commits.contains_key(&req.idx))
    }

    pub(crate) fn add_commit(&mut self, req: CommitReq) -> bool {
        let commits = self.commit_pool.entry(req.block_hash).or_default();
        if commits.contains_key(&req.idx) {
            return false;
        }
        commits.insert(req.idx, req);
        true
    }

    pub(crate) fn commit_count(&self, hash: &CryptoHash) -> usize {
        self.commit_pool.get(hash).map_or(0, |commits| commits.len())
    }

    /// Number of block hashes that `idx` currently has a sign held for.
    pub(crate) fn signs_from(&self, idx: NodeIndex) -> usize {
        self.sign_pool.values().filter(|signs| signs.contains_key(&idx)).count()
    }

    /// Number of block hashes that `idx` currently has a commit held for.
    pub(crate) fn commits_from(&self, idx: NodeIndex) -> usize {
        self.commit_pool.values().filter(|commits| commits.contains_key(&idx)).count()
    }

    /// Get up to `limit` `(signer, signature over hash)` pairs from the sign pool of `hash`, ordered by
    /// signer.
    pub(crate) fn signatures_for(&self, hash: &CryptoHash, limit: usize) -> Vec<(NodeIndex, SignatureBytes)> {
        let mut signatures: Vec<(NodeIndex, SignatureBytes)> = self
            .sign_pool
            .get(hash)
            .map(|signs| signs.values().map(|sign| (sign.idx, sign.sig)).collect())
            .unwrap_or_default();
        signatures.sort_by_key(|(idx, _)| *idx);
        signatures.truncate(limit);
        signatures
    }

    /* ↓↓↓ View changes ↓↓↓ */

    pub(crate) fn is_existing_view_change(&self, req: &ViewChangeReq) -> bool {
        self.view_change_pool
            .get(&req.view)
            .is_some_and(|reqs| reqs.contains_key(&req.idx))
    }

    pub(crate) fn add_view_change(&mut self, req: ViewChangeReq) -> bool {
        let reqs = self.view_change_pool.entry(req.view).or_default();
        if reqs.contains_key(&req.idx) {
            return false;
        }
        reqs.insert(req.idx, req);
        true
    }

    pub(crate) fn view_change_count(&self, view: ViewNumber) -> usize {
        self.view_change_pool.get(&view).map_or(0, |reqs| reqs.len())
    }

    /// Keep only the `max_views` highest views that `idx` has requested a change to.
    pub(crate) fn limit_view_changes_from(&mut self, idx: NodeIndex, max_views: usize) {
        let mut seen = 0;
        for reqs in self.view_change_pool.values_mut().rev() {
            if reqs.contains_key(&idx) {
                seen += 1;
                if seen > max_views {
                    reqs.remove(&idx);
                }
            }
        }
        self.view_change_pool.retain(|_, reqs| !reqs.is_empty());
    }

    /// Drop the view changes for `view` that reference a block below `highest`, or a different block at
    /// the height of `highest`.
    pub(crate) fn remove_invalid_view_change(&mut self, view: ViewNumber, highest: &BlockHeader) {
        let highest_hash = highest.hash();
        if let Some(reqs) = self.view_change_pool.get_mut(&view) {
            reqs.retain(|_, req| {
                req.height > highest.height
                    || (req.height == highest.height && req.block_hash == highest_hash)
            });
            if reqs.is_empty() {
                self.view_change_pool.remove(&view);
            }
        }
    }

    /// Drop the view changes that reference a block below `highest_height`.
    pub(crate) fn remove_stale_view_changes(&mut self, highest_height: BlockHeight) {
        self.view_change_pool.retain(|_, reqs| {
            reqs.retain(|_, req| req.height >= highest_height);
            !reqs.is_empty()
        });
    }

    /// Decide whether the view changes held indicate that the rest of the sealers have moved ahead of
    /// `to_view`.
    ///
    /// Every sealer that has requested a view above `to_view`, at a height no lower than
    /// `highest_height`, is counted once, at the lowest such view. If more than `max_faulty` sealers are
    /// counted, the lowest of their views is returned, because at least one honest sealer wants it.
    ///
    /// Returns `None` if the lowest requested height is both the consensus height and the height of the
    /// committed prepare: in that case the committed prepare is about to be re-proposed, and moving view
    /// would only delay it.
    pub(crate) fn can_trigger_view_change(
        &self,
        max_faulty: usize,
        to_view: ViewNumber,
        highest_height: BlockHeight,
        consensus_height: BlockHeight,
    ) -> Option<ViewNumber> {
        let mut lowest_view_of: HashMap<NodeIndex, ViewNumber> = HashMap::new();
        let mut min_height: Option<BlockHeight> = None;
        for (view, reqs) in self.view_change_pool.range(to_view + 1..) {
            for (idx, req) in reqs {
                if req.height < highest_height {
                    continue;
                }
                // Views are visited in ascending order, so the first entry for a sealer is its lowest.
                lowest_view_of.entry(*idx).or_insert(*view);
                min_height = Some(min_height.map_or(req.height, |h| h.min(req.height)));
            }
        }

        if lowest_view_of.len() <= max_faulty {
            return None;
        }

        let committed_height = self.committed_prepare.as_ref().map(|req| req.height);
        if min_height == Some(consensus_height) && committed_height == Some(consensus_height) {
            return None;
        }

        lowest_view_of.values().min().copied()
    }

    /// Purge the prepare, sign, and commit state of the view being abandoned. View changes for views above
    /// `view`, future prepares, and the committed prepare are kept.
    pub(crate) fn trigger_view_change(&mut self, view: ViewNumber) {
        self.raw_prepare = None;
        self.prepare = None;
        self.sign_pool.clear();
        self.commit_pool.clear();
        self.view_change_pool = self.view_change_pool.split_off(&(view + 1));
    }

    /* ↓↓↓ Future prepares ↓↓↓ */

    /// Hold `req` until its height becomes reachable. Only one prepare is held per height; it is replaced
    /// only by a prepare for a higher view.
    pub(crate) fn add_future_prepare(&mut self, req: PrepareReq) -> bool {
        if let Some(held) = self.future_prepares.get(&req.height) {
            if held.view >= req.view {
                return false;
            }
        }
        self.future_prepares.insert(req.height, req);
        true
    }

    pub(crate) fn future_prepare(&self, height: BlockHeight) -> Option<&PrepareReq> {
        self.future_prepares.get(&height)
    }

    pub(crate) fn remove_future_prepare(&mut self, height: BlockHeight) -> Option<PrepareReq> {
        self.future_prepares.remove(&height)
    }

    pub(crate) fn future_prepare_count(&self) -> usize {
        self.future_prepares.len()
    }

    /* ↓↓↓ Cleanup ↓↓↓ */

    /// Clear the state of a round that has just been finalized at `finalized_height`.
    pub(crate) fn clear_finalized(&mut self, finalized_height: BlockHeight) {
        if let Some(prepare) = self.prepare.take() {
            if prepare.req.height > finalized_height {
                self.prepare = Some(prepare);
            } else {
                self.sign_pool.remove(&prepare.req.block_hash);
                self.commit_pool.remove(&prepare.req.block_hash);
            }
        }
        if self.raw_prepare.as_ref().is_some_and(|raw| raw.height <= finalized_height) {
            self.raw_prepare = None;
        }
        self.future_prepares = self.future_prepares.split_off(&(finalized_height + 1));
    }

    /// Drop pool entries for heights at or below `finalized_height - retention_margin` or more than
    /// `future_window` heights above the next height to agree on, and future prepares that are now
    /// unreachable or out of that window.
    ///
    /// Nothing is stale while `finalized_height` is still below `retention_margin`.
    pub(crate) fn collect_garbage(
        &mut self,
        finalized_height: BlockHeight,
        retention_margin: u64,
        future_window: u64,
    ) {
        let horizon = (finalized_height.int() >= retention_margin).then(|| finalized_height - retention_margin);
        let is_stale = |height: BlockHeight| horizon.is_some_and(|horizon| height <= horizon);
        let ceiling = finalized_height + future_window + 1;
        let is_kept = |height: BlockHeight| !is_stale(height) && height <= ceiling;

        self.sign_pool.retain(|_, signs| {
            signs.retain(|_, sign| is_kept(sign.height));
            !signs.is_empty()
        });
        self.commit_pool.retain(|_, commits| {
            commits.retain(|_, commit| is_kept(commit.height));
            !commits.is_empty()
        });
        self.view_change_pool.retain(|_, reqs| {
            reqs.retain(|_, req| is_kept(req.height));
            !reqs.is_empty()
        });

        self.future_prepares
            .retain(|height, _| *height > finalized_height && *height <= ceiling);

        if self.raw_prepare.as_ref().is_some_and(|raw| is_stale(raw.height)) {
            self.raw_prepare = None;
        }
        if self.prepare.as_ref().is_some_and(|prepare| is_stale(prepare.req.height)) {
            self.prepare = None;
        }
    }

    pub(crate) fn sign_pool_len(&self) -> usize {
        self.sign_pool.values().map(|signs| signs.len()).sum()
    }

    pub(crate) fn commit_pool_len(&self) -> usize {
        self.commit_pool.values().map(|commits| commits.len()).sum()
    }

    pub(crate) fn view_change_pool_len(&self) -> usize {
        self.view_change_pool.values().map(|reqs| reqs.len()).sum()
    }
}
