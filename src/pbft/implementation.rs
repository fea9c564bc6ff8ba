/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of the PBFT replica.
//!
//! Main type: [`PBFTEngine`].
//!
//! ## Rounds
//!
//! The engine agrees on one block height at a time, the "consensus height", which is always one above the
//! highest block in the chain. A round at that height goes through these steps:
//! 1. **Prepare**: the leader of the current view seals a block and broadcasts it in a [`PrepareReq`].
//! 2. **Sign**: every sealer that accepts the prepare executes the block and broadcasts a [`SignReq`] over
//!    the hash of the executed block.
//! 3. **Commit**: a sealer that collects exactly a quorum of sign requests for the block it executed
//!    persists the prepare as its committed prepare, then broadcasts a [`CommitReq`].
//! 4. **Finalize**: a sealer that collects a quorum of sign requests and a quorum of commit requests appends
//!    the block, together with the signatures it collected, to the chain.
//!
//! All of this must happen within the view it started in. If it does not, the view times out and the
//! sealers move to the next view, and thereby to the next leader, by exchanging [`ViewChangeReq`]s. See
//! [`view_timer`](super::view_timer) for how the timeout is computed.
//!
//! ## Committed prepare
//!
//! A sealer that has broadcast a commit request for a block must never help finalize a different block at
//! the same height. Its committed prepare survives view changes and restarts (through the
//! [`Backup`]), and:
//! 1. It rejects prepares at that height whose hash differs from the committed prepare's.
//! 2. When it becomes leader at that height, it re-proposes the committed prepare instead of sealing a new
//!    block.
//!
//! ## Threading
//!
//! The engine is owned by the consensus worker thread spawned by [`start`](PBFTEngine::start). Every
//! mutation of its state happens on that thread, in reaction either to a message queued by the
//! [poller](crate::networking::receiving) or to the passage of time.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex, RwLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

use crate::{
    backup::{pluggables::KVStore, Backup, BackupError},
    events::*,
    hooks::Hooks,
    networking::{
        messages::{PacketEnvelope, PacketKind},
        network::Network,
        receiving::InboundMessage,
        router::BroadcastRouter,
    },
    pluggables::{BlockSync, ChainStorage, CommitResult, Executor, TxPool},
    types::{
        block::{Block, BlockHeader},
        crypto_primitives::Keypair,
        data_types::{BlockHeight, CryptoHash, NodeIndex, ViewNumber},
        sealer_set::SealerSet,
    },
};

use super::{
    messages::{
        millis_since_unix_epoch, CommitReq, PBFTMsg, PartialPrepareReq, PrepareReq, SignReq, ViewChangeReq,
    },
    partial_block::{into_prepare, GetMissedTxs, MissedTxs, PartialBlock, PartialPrepareCache},
    request_cache::{ExecutedPrepare, RequestCache},
    status::ConsensusStatus,
    view_timer::{ViewState, ViewTimer},
};

/// Longest time the worker waits for a message before checking timers.
const RECV_TIMEOUT: Duration = Duration::from_millis(5);

/// Number of distinct views a single sealer can have a view change request held for.
pub(crate) const MAX_VIEW_CHANGES_PER_SIGNER: usize = 4;

/// Configuration parameters for the [`PBFTEngine`].
pub(crate) struct PBFTConfiguration {
    pub(crate) keypair: Keypair,
    pub(crate) empty_block_generation_time: Duration,
    pub(crate) min_block_generation_time: Duration,
    pub(crate) max_block_transactions: usize,
    pub(crate) omit_empty_block: bool,
    pub(crate) enable_partial_block: bool,
    pub(crate) garbage_collection_interval: Duration,
    pub(crate) cache_retention_margin: u64,
    pub(crate) future_block_window: u64,
}

/// Outcome of checking a received message against the engine's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CheckResult {
    Valid,
    Invalid,
    /// The message cannot be processed yet, but may become valid once the replica catches up.
    Future,
}

/// The collaborators the engine drives.
pub(crate) struct Collaborators {
    pub(crate) executor: Box<dyn Executor>,
    pub(crate) chain: Box<dyn ChainStorage>,
    pub(crate) tx_pool: Arc<dyn TxPool>,
    pub(crate) block_sync: Box<dyn BlockSync>,
}

pub(crate) struct PBFTEngine<N: Network, K: KVStore> {
    config: PBFTConfiguration,
    router: BroadcastRouter<N>,
    cache: RequestCache,
    partials: PartialPrepareCache,
    timer: ViewTimer,
    backup: Backup<K>,
    executor: Box<dyn Executor>,
    chain: Box<dyn ChainStorage>,
    tx_pool: Arc<dyn TxPool>,
    block_sync: Box<dyn BlockSync>,
    sealer_set: SealerSet,
    shared_sealer_set: Arc<RwLock<SealerSet>>,
    my_idx: Option<NodeIndex>,
    highest: BlockHeader,
    consensus_height: BlockHeight,
    next_leader_notified: bool,
    last_garbage_collection: Instant,
    view_map: HashMap<VerifyingKey, ViewNumber>,
    status: Arc<RwLock<ConsensusStatus>>,
    hooks: Hooks,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network + 'static, K: KVStore> PBFTEngine<N, K> {
    /// Create an engine that resumes from the highest block in `chain`, and from the committed prepare in
    /// `backup` if the chain has not caught up with it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: PBFTConfiguration,
        router: BroadcastRouter<N>,
        timer: ViewTimer,
        forward_height_window: u64,
        backup: Backup<K>,
        collaborators: Collaborators,
        shared_sealer_set: Arc<RwLock<SealerSet>>,
        status: Arc<RwLock<ConsensusStatus>>,
        hooks: Hooks,
        event_publisher: Option<Sender<Event>>,
    ) -> PBFTEngine<N, K> {
        let Collaborators {
            executor,
            chain,
            tx_pool,
            block_sync,
        } = collaborators;

        let highest = chain
            .block_at(chain.current_height())
            .map(|block| block.header)
            .unwrap_or_else(|| Block::genesis().header);
        let sealer_set = router.sealer_set().clone();
        let my_idx = sealer_set.index_of(&config.keypair.public());

        let mut cache = RequestCache::new();
        if let Some(committed) = backup.load_committed_prepare() {
            if committed.height > highest.height {
                log::info!(
                    "Resuming with a committed prepare at height {}, view {}",
                    committed.height,
                    committed.view
                );
                cache.set_committed_prepare(committed);
            }
        }

        PBFTEngine {
            config,
            router,
            cache,
            partials: PartialPrepareCache::new(forward_height_window),
            timer,
            backup,
            executor,
            chain,
            tx_pool,
            block_sync,
            sealer_set,
            shared_sealer_set,
            my_idx,
            consensus_height: highest.height + 1,
            highest,
            next_leader_notified: false,
            last_garbage_collection: Instant::now(),
            view_map: HashMap::new(),
            status,
            hooks,
            event_publisher,
        }
    }

    /// Spawn the consensus worker thread, which runs the engine until `shutdown_signal` fires or a
    /// [`FatalError`] occurs. A fatal error is recorded in `fatal_error`.
    pub(crate) fn start(
        mut self,
        inbound: Receiver<InboundMessage>,
        shutdown_signal: Receiver<()>,
        fatal_error: Arc<Mutex<Option<FatalError>>>,
    ) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Consensus worker thread disconnected from main thread")
                }
            }

            let result = match inbound.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => self.on_receive_msg(msg),
                Err(RecvTimeoutError::Timeout) => Ok(()),
                Err(RecvTimeoutError::Disconnected) => return,
            }
            .and_then(|()| self.tick(Instant::now()));

            if let Err(err) = result {
                log::error!("Consensus stopped: {}", err);
                self.hooks.fatal(&err);
                if let Ok(mut fatal_error) = fatal_error.lock() {
                    *fatal_error = Some(err);
                }
                return;
            }
        })
    }

    /// Perform the time-driven duties of the engine:
    /// 1. Pick up blocks appended to the chain by block sync.
    /// 2. Seal a block, if this replica is the leader.
    /// 3. Check whether the view has timed out.
    /// 4. Replay the future prepare for the consensus height, if there is one.
    /// 5. Collect garbage, if it is time to.
    /// 6. Check whether the backup writer has failed.
    /// 7. Publish the status snapshot.
    pub(crate) fn tick(&mut self, now: Instant) -> Result<(), FatalError> {
        self.sync_with_chain(now);
        self.try_seal(now)?;
        self.check_timeout(now);
        self.replay_future_prepare(now)?;
        self.collect_garbage(now);
        if let Some(err) = self.backup.poll_failure() {
            return Err(err);
        }
        self.publish_status();
        Ok(())
    }

    pub(crate) fn on_receive_msg(&mut self, msg: InboundMessage) -> Result<(), FatalError> {
        let now = Instant::now();
        match msg {
            InboundMessage::Consensus(envelope) => match envelope.packet.kind {
                PacketKind::PrepareReq => match decode::<PrepareReq>(&envelope) {
                    Some(req) => self.on_receive_prepare(req, &envelope, now),
                    None => Ok(()),
                },
                PacketKind::SignReq => match decode::<SignReq>(&envelope) {
                    Some(req) => self.on_receive_sign(req, &envelope, now),
                    None => Ok(()),
                },
                PacketKind::CommitReq => match decode::<CommitReq>(&envelope) {
                    Some(req) => self.on_receive_commit(req, &envelope, now),
                    None => Ok(()),
                },
                PacketKind::ViewChangeReq => {
                    if let Some(req) = decode::<ViewChangeReq>(&envelope) {
                        self.on_receive_view_change(req, &envelope, now)
                    }
                    Ok(())
                }
                kind => {
                    log::debug!("Unexpected {:?} packet in the consensus queue", kind);
                    Ok(())
                }
            },
            InboundMessage::PartialPrepare {
                envelope,
                prepare,
                partial_block,
            } => self.on_receive_partial_prepare(prepare, partial_block, envelope, now),
            InboundMessage::GetMissedTxs(envelope) => {
                if let Some(req) = decode::<GetMissedTxs>(&envelope) {
                    self.on_receive_get_missed_txs(req, &envelope)
                }
                Ok(())
            }
            InboundMessage::MissedTxs(envelope) => match decode::<MissedTxs>(&envelope) {
                Some(missed) => self.on_receive_missed_txs(missed, now),
                None => Ok(()),
            },
        }
    }

    /* ↓↓↓ Prepare ↓↓↓ */

    /// Check a prepare (or partial prepare) message, in this order:
    /// 1. A prepare for the same height and view was already accepted.
    /// 2. Block sync is already fetching blocks beyond this height.
    /// 3. The height is already finalized, or the view is already over.
    /// 4. The height or the view is ahead of the replica's: `Future`, if correctly signed.
    /// 5. The signer is not the leader of the current view.
    /// 6. The hash differs from the committed prepare at the same height.
    /// 7. The signature is incorrect.
    pub(crate) fn is_valid_prepare(&self, msg: &PBFTMsg) -> CheckResult {
        if self.cache.is_existing_prepare(msg.height, msg.view) {
            return CheckResult::Invalid;
        }

        if self.block_sync.is_syncing() && self.block_sync.known_highest() >= msg.height {
            return CheckResult::Invalid;
        }

        if msg.height < self.consensus_height || msg.view < self.timer.view() {
            return CheckResult::Invalid;
        }

        let Some(signer) = self.sealer_set.get(msg.idx) else {
            return CheckResult::Invalid;
        };

        if msg.height > self.consensus_height || msg.view > self.timer.view() {
            return if msg.is_correctly_signed(signer) {
                CheckResult::Future
            } else {
                CheckResult::Invalid
            };
        }

        if self.timer.leader_failed() || self.current_leader() != Some(msg.idx) {
            log::debug!("Prepare at view {} is not from the leader", msg.view);
            return CheckResult::Invalid;
        }

        if let Some(committed) = self.cache.committed_prepare() {
            if committed.height == msg.height && committed.block_hash != msg.block_hash {
                log::debug!("Prepare at height {} conflicts with the committed prepare", msg.height);
                return CheckResult::Invalid;
            }
        }

        if !msg.is_correctly_signed(signer) {
            return CheckResult::Invalid;
        }

        CheckResult::Valid
    }

    fn on_receive_prepare(
        &mut self,
        req: PrepareReq,
        envelope: &PacketEnvelope,
        now: Instant,
    ) -> Result<(), FatalError> {
        Event::ReceivePrepare(ReceivePrepareEvent {
            timestamp: SystemTime::now(),
            origin: envelope.sender,
            height: req.height,
            view: req.view,
            block: req.block_hash,
        })
        .publish(&self.event_publisher);

        let result = self.is_valid_prepare(&req.msg);
        self.forward_if_needed(envelope, result != CheckResult::Invalid, &req.msg, PacketKind::PrepareReq, None);
        self.handle_checked_prepare(req, result, now)
    }

    /// Act on a prepare that has been checked by [`is_valid_prepare`](Self::is_valid_prepare).
    fn handle_checked_prepare(
        &mut self,
        req: PrepareReq,
        result: CheckResult,
        now: Instant,
    ) -> Result<(), FatalError> {
        match result {
            CheckResult::Invalid => Ok(()),
            CheckResult::Future => {
                self.note_view(&req.msg);
                if self.cache.add_future_prepare(req) {
                    log::debug!("Cached a future prepare");
                }
                Ok(())
            }
            CheckResult::Valid => {
                self.note_view(&req.msg);
                if !self.cache.add_raw_prepare(req.clone()) {
                    return Ok(());
                }
                self.execute_and_sign(req, now)
            }
        }
    }

    /// Execute the block in `raw`, store the executed prepare, and broadcast a sign request for it.
    fn execute_and_sign(&mut self, raw: PrepareReq, now: Instant) -> Result<(), FatalError> {
        let Some(my_idx) = self.my_idx else {
            return Ok(());
        };

        let block = &raw.block;
        if block.header.parent_hash != self.highest.hash()
            || block.height() != self.highest.height + 1
            || !block.is_transactions_root_correct()
            || block.hash() != raw.block_hash
        {
            log::debug!("Prepared block at height {} does not extend the chain", block.height());
            return Ok(());
        }

        if block.transactions.is_empty() && self.config.omit_empty_block {
            log::debug!("Omitting an empty block at height {}", block.height());
            self.omit_round();
            return Ok(());
        }

        let result = match self.executor.execute(block) {
            Ok(result) => result,
            Err(err) => {
                log::warn!("Abandoning the round at height {}: {}", block.height(), err);
                return Ok(());
            }
        };

        let mut executed_block = block.clone();
        executed_block.header.state_root = result.state_root;
        let executed = raw.executed(&self.config.keypair, executed_block);

        // The next leader learns early which transactions to leave out of its own block.
        if raw.idx != my_idx
            && self.sealer_set.next_leader(self.timer.view(), self.highest.height) == Some(my_idx)
        {
            let tx_hash_filter: HashSet<CryptoHash> = raw.block.tx_hashes().into_iter().collect();
            self.hooks.next_leader_notify(&tx_hash_filter);
            self.next_leader_notified = true;
        }

        self.cache.add_prepare(ExecutedPrepare {
            req: executed.clone(),
            context: result.context,
        });

        let sign = SignReq::new(&self.config.keypair, &executed, my_idx);
        self.broadcast(PacketKind::SignReq, &sign.unique_key(), &sign);
        self.cache.add_sign(sign);

        Event::Sign(SignEvent {
            timestamp: SystemTime::now(),
            height: executed.height,
            view: executed.view,
            block: executed.block_hash,
        })
        .publish(&self.event_publisher);

        self.check_and_commit(now)
    }

    /* ↓↓↓ Sign and commit ↓↓↓ */

    /// Check a sign or commit request against the executed prepare.
    ///
    /// A request for another block is `Future` if it is correctly signed and its height is between the
    /// consensus height and `future_block_window` heights above it, since the replica may simply not
    /// have executed that block yet.
    fn check_vote(&self, msg: &PBFTMsg) -> CheckResult {
        if Some(msg.idx) == self.my_idx {
            return CheckResult::Invalid;
        }
        let Some(signer) = self.sealer_set.get(msg.idx) else {
            return CheckResult::Invalid;
        };

        match self.cache.prepare() {
            Some(prepare) if prepare.req.block_hash == msg.block_hash => {
                if msg.view != prepare.req.view || !msg.is_correctly_signed(signer) {
                    CheckResult::Invalid
                } else {
                    CheckResult::Valid
                }
            }
            _ => {
                let ceiling = self.consensus_height + self.config.future_block_window;
                if msg.height >= self.consensus_height && msg.height <= ceiling && msg.is_correctly_signed(signer)
                {
                    CheckResult::Future
                } else {
                    CheckResult::Invalid
                }
            }
        }
    }

    /// A signer gets at most one held vote of each kind per height in the future window.
    fn max_future_votes_per_signer(&self) -> usize {
        usize::try_from(self.config.future_block_window)
            .unwrap_or(usize::MAX)
            .saturating_add(1)
    }

    fn on_receive_sign(
        &mut self,
        req: SignReq,
        envelope: &PacketEnvelope,
        now: Instant,
    ) -> Result<(), FatalError> {
        Event::ReceiveSign(ReceiveSignEvent {
            timestamp: SystemTime::now(),
            origin: envelope.sender,
            height: req.height,
            view: req.view,
            block: req.block_hash,
        })
        .publish(&self.event_publisher);

        let result = if self.cache.is_existing_sign(&req) {
            CheckResult::Invalid
        } else {
            self.check_vote(&req)
        };
        self.forward_if_needed(envelope, result != CheckResult::Invalid, &req, PacketKind::SignReq, None);

        match result {
            CheckResult::Invalid => Ok(()),
            CheckResult::Future => {
                self.note_view(&req);
                // Held future signs must leave room for this replica's own sign to complete the quorum.
                if self.cache.sign_count(&req.block_hash) + 1 < self.quorum()
                    && self.cache.signs_from(req.idx) < self.max_future_votes_per_signer()
                {
                    self.cache.add_sign(req);
                }
                Ok(())
            }
            CheckResult::Valid => {
                self.note_view(&req);
                if self.cache.add_sign(req) {
                    self.check_and_commit(now)?;
                    self.check_and_save(now)?;
                }
                Ok(())
            }
        }
    }

    fn on_receive_commit(
        &mut self,
        req: CommitReq,
        envelope: &PacketEnvelope,
        now: Instant,
    ) -> Result<(), FatalError> {
        Event::ReceiveCommit(ReceiveCommitEvent {
            timestamp: SystemTime::now(),
            origin: envelope.sender,
            height: req.height,
            view: req.view,
            block: req.block_hash,
        })
        .publish(&self.event_publisher);

        let result = if self.cache.is_existing_commit(&req) {
            CheckResult::Invalid
        } else {
            self.check_vote(&req)
        };
        self.forward_if_needed(envelope, result != CheckResult::Invalid, &req, PacketKind::CommitReq, None);

        match result {
            CheckResult::Invalid => Ok(()),
            CheckResult::Future => {
                self.note_view(&req);
                if self.cache.commit_count(&req.block_hash) + 1 < self.quorum()
                    && self.cache.commits_from(req.idx) < self.max_future_votes_per_signer()
                {
                    self.cache.add_commit(req);
                }
                Ok(())
            }
            CheckResult::Valid => {
                self.note_view(&req);
                if self.cache.add_commit(req) {
                    self.check_and_save(now)?;
                }
                Ok(())
            }
        }
    }

    /// If the sign pool of the executed prepare has just reached a quorum, persist the prepare as the
    /// committed prepare and broadcast a commit request for it.
    ///
    /// The sign count is compared with the quorum by equality, so the commit request is broadcast once per
    /// round no matter how many sign requests arrive after the quorum is reached.
    fn check_and_commit(&mut self, now: Instant) -> Result<(), FatalError> {
        let Some(my_idx) = self.my_idx else {
            return Ok(());
        };
        let Some(prepare) = self.cache.prepare() else {
            return Ok(());
        };
        if prepare.req.view != self.timer.view() {
            return Ok(());
        }
        let hash = prepare.req.block_hash;
        if self.cache.sign_count(&hash) != self.quorum() {
            return Ok(());
        }
        if self
            .cache
            .committed_prepare()
            .is_some_and(|committed| committed.block_hash == hash && committed.view == prepare.req.view)
        {
            return Ok(());
        }

        let Some(committed) = self.cache.mark_committed().cloned() else {
            return Ok(());
        };
        self.backup.store_committed_prepare(&committed)?;

        let commit = CommitReq::new(&self.config.keypair, &committed, my_idx);
        self.broadcast(PacketKind::CommitReq, &commit.unique_key(), &commit);
        self.cache.add_commit(commit);
        self.timer.note_sign_quorum(now);

        Event::Commit(CommitEvent {
            timestamp: SystemTime::now(),
            height: committed.height,
            view: committed.view,
            block: committed.block_hash,
        })
        .publish(&self.event_publisher);

        self.check_and_save(now)
    }

    /// If both the sign pool and the commit pool of the executed prepare have reached a quorum within the
    /// current view, append the block to the chain.
    fn check_and_save(&mut self, now: Instant) -> Result<(), FatalError> {
        let Some(prepare) = self.cache.prepare() else {
            return Ok(());
        };
        if prepare.req.view != self.timer.view() || prepare.req.height <= self.highest.height {
            return Ok(());
        }
        let hash = prepare.req.block_hash;
        let quorum = self.quorum();
        if self.cache.sign_count(&hash) < quorum || self.cache.commit_count(&hash) < quorum {
            return Ok(());
        }

        let mut block = prepare.req.block.clone();
        let context = prepare.context.clone();
        block.signatures = self.cache.signatures_for(&hash, quorum);

        // The committed prepare must be durable before the block it guards leaves this replica.
        self.backup.flush()?;

        match self.chain.append(block.clone(), context) {
            CommitResult::Ok => {
                self.tx_pool.drop_committed(&block);
                self.block_sync.note_sealing_height(block.height());
                Event::FinalizeBlock(FinalizeBlockEvent {
                    timestamp: SystemTime::now(),
                    height: block.height(),
                    block: hash,
                    tx_count: block.transactions.len(),
                    signatures: block.signatures.len(),
                })
                .publish(&self.event_publisher);
                self.report_block(&block.header, block.transactions.len(), now);
            }
            result => {
                log::warn!(
                    "Chain storage refused block {:?} at height {}: {:?}",
                    hash,
                    block.height(),
                    result
                );
                self.block_sync.note_sealing_height(self.chain.current_height());
                self.tx_pool.handle_bad_block(&block);
            }
        }
        Ok(())
    }

    /// Move the replica past a block that was appended to the chain, either by this engine or by block sync.
    fn report_block(&mut self, header: &BlockHeader, tx_count: usize, now: Instant) {
        if header.height != BlockHeight::new(0) && header.height <= self.highest.height {
            return;
        }
        self.highest = header.clone();
        let change_cycle = self.timer.change_cycle();

        if header.height >= self.consensus_height {
            self.timer.on_block_finalized(now);
            self.consensus_height = header.height + 1;
            self.cache.remove_stale_view_changes(header.height);
        }
        self.cache.clear_finalized(header.height);
        self.partials.clear_pending();
        self.partials.clear_pre_raw_prepare();

        let sealer_set = self.chain.sealer_set();
        if sealer_set != self.sealer_set {
            log::info!("Sealer set changed to {} sealers at height {}", sealer_set.len(), header.height);
            self.update_sealer_set(sealer_set);
        }

        self.hooks.commit_block(header.height, tx_count, change_cycle);
    }

    fn sync_with_chain(&mut self, now: Instant) {
        let chain_height = self.chain.current_height();
        if chain_height <= self.highest.height {
            return;
        }
        if let Some(block) = self.chain.block_at(chain_height) {
            log::debug!("Picked up block {} appended by block sync", chain_height);
            self.report_block(&block.header, block.transactions.len(), now);
        }
    }

    fn update_sealer_set(&mut self, sealer_set: SealerSet) {
        self.my_idx = sealer_set.index_of(&self.config.keypair.public());
        self.router.update_sealer_set(sealer_set.clone());
        if let Ok(mut shared) = self.shared_sealer_set.write() {
            *shared = sealer_set.clone();
        }
        self.sealer_set = sealer_set;
    }

    /* ↓↓↓ Sealing ↓↓↓ */

    fn current_leader(&self) -> Option<NodeIndex> {
        self.sealer_set.leader(self.timer.view(), self.highest.height)
    }

    fn is_leader(&self) -> bool {
        self.my_idx.is_some()
            && self.timer.state() == ViewState::Stable
            && self.current_leader() == self.my_idx
    }

    /// Seal and propose a block, if this replica is the leader and it is time to.
    ///
    /// A block is sealed once `min_block_generation_time` has passed since the last progress and there are
    /// pending transactions, or once `empty_block_generation_time` has passed. A replica that was notified
    /// as next leader does not wait for `min_block_generation_time`.
    fn try_seal(&mut self, now: Instant) -> Result<(), FatalError> {
        if !self.is_leader() || self.block_sync.is_syncing() {
            return Ok(());
        }
        if self
            .cache
            .raw_prepare()
            .is_some_and(|raw| raw.height == self.consensus_height)
        {
            return Ok(());
        }

        if self
            .cache
            .committed_prepare()
            .is_some_and(|committed| committed.height == self.consensus_height)
        {
            return self.rehandle_committed_prepare(now);
        }

        let elapsed = self.timer.since_last_consensus(now).unwrap_or_default();
        let pending = self.tx_pool.pending_count();
        let min_time_passed = elapsed >= self.config.min_block_generation_time || self.next_leader_notified;
        let empty_time_passed = elapsed >= self.config.empty_block_generation_time;
        if !(pending > 0 && min_time_passed) && !empty_time_passed {
            return Ok(());
        }

        let transactions = self
            .tx_pool
            .pending(self.config.max_block_transactions, &HashSet::new());
        if transactions.is_empty() && self.config.omit_empty_block {
            if empty_time_passed {
                log::debug!("No transactions to seal at height {}, passing on the round", self.consensus_height);
                self.omit_round();
            }
            return Ok(());
        }

        let Some(my_idx) = self.my_idx else {
            return Ok(());
        };
        let block = Block::new(
            self.consensus_height,
            self.highest.hash(),
            my_idx,
            millis_since_unix_epoch(),
            transactions,
        );
        let raw = PrepareReq::new(&self.config.keypair, self.timer.view(), my_idx, block);
        self.next_leader_notified = false;
        self.propose(raw, self.config.enable_partial_block, now)
    }

    /// Re-propose the committed prepare under the current view.
    fn rehandle_committed_prepare(&mut self, now: Instant) -> Result<(), FatalError> {
        let (Some(committed), Some(my_idx)) = (self.cache.committed_prepare().cloned(), self.my_idx) else {
            return Ok(());
        };
        log::info!(
            "Re-proposing the committed prepare at height {} in view {}",
            committed.height,
            self.timer.view()
        );
        self.router.clear_broadcast_filter();
        let raw = committed.resign(&self.config.keypair, self.timer.view(), my_idx);
        self.propose(raw, false, now)
    }

    fn propose(&mut self, raw: PrepareReq, allow_partial: bool, now: Instant) -> Result<(), FatalError> {
        if !self.cache.add_raw_prepare(raw.clone()) {
            return Ok(());
        }

        let partial = allow_partial && !raw.block.transactions.is_empty();
        if partial {
            self.partials.set_pre_raw_prepare(raw.clone());
            let partial_prepare = PartialPrepareReq::from_prepare(&raw);
            self.broadcast(PacketKind::PartialPrepareReq, &raw.unique_key(), &partial_prepare);
        } else {
            self.broadcast(PacketKind::PrepareReq, &raw.unique_key(), &raw);
        }

        Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            height: raw.height,
            view: raw.view,
            block: raw.block_hash,
            tx_count: raw.block.transactions.len(),
            partial,
        })
        .publish(&self.event_publisher);

        self.execute_and_sign(raw, now)
    }

    /// Give up on the current round without waiting for the view to time out.
    fn omit_round(&mut self) {
        self.timer.set_leader_failed();
        self.timer.fast_view_change();
        self.timer.reset_change_cycle();
    }

    /* ↓↓↓ View change ↓↓↓ */

    fn check_timeout(&mut self, now: Instant) {
        let Some(my_idx) = self.my_idx else {
            return;
        };
        if !self.timer.is_timeout(now) {
            return;
        }

        if !self.timer.is_fast_view_change()
            && self
                .cache
                .raw_prepare()
                .is_some_and(|raw| raw.height > self.highest.height)
        {
            self.hooks.consensus_timeout(self.tx_pool.pending_count());
        }

        let view = self.timer.view();
        let timeout = self.timer.current_timeout();
        let to_view = self.timer.on_timeout(now);
        self.cache.remove_invalid_view_change(to_view, &self.highest);

        Event::ViewTimeout(ViewTimeoutEvent {
            timestamp: SystemTime::now(),
            view,
            to_view,
            timeout,
        })
        .publish(&self.event_publisher);
        self.router.log_unreachable_sealers();

        let view_change = ViewChangeReq::new(&self.config.keypair, &self.highest, to_view, my_idx);
        self.broadcast(PacketKind::ViewChangeReq, &view_change.unique_key(), &view_change);
        Event::SendViewChange(SendViewChangeEvent {
            timestamp: SystemTime::now(),
            view: to_view,
            highest_height: self.highest.height,
        })
        .publish(&self.event_publisher);

        self.check_and_change_view(now);
        self.hooks.view_change();
    }

    /// Enter `to_view` once `quorum - 1` other sealers have asked for it.
    fn check_and_change_view(&mut self, now: Instant) {
        let to_view = self.timer.to_view();
        if to_view <= self.timer.view() {
            return;
        }
        if self.cache.view_change_count(to_view) + 1 < self.quorum() {
            return;
        }

        if self.timer.adopt_to_view(now) {
            log::debug!("Skipped to view {}, backoff reset", to_view);
        }
        self.next_leader_notified = false;
        self.cache.trigger_view_change(to_view);
        self.partials.clear_pending();
        self.partials.clear_pre_raw_prepare();
        self.block_sync.note_sealing_height(self.consensus_height);

        Event::StartView(StartViewEvent {
            timestamp: SystemTime::now(),
            view: to_view,
            leader: self
                .current_leader()
                .and_then(|idx| self.sealer_set.get(idx))
                .copied(),
        })
        .publish(&self.event_publisher);
    }

    /// Check a view change request, in this order:
    /// 1. The same sealer already asked for the same view.
    /// 2. The request is this replica's own.
    /// 3. It references a block below the highest block.
    /// 4. It asks for a view that is not above the current view.
    /// 5. At the height of the highest block, it references another block.
    /// 6. The block it references is not in the chain.
    /// 7. The signature is incorrect.
    fn is_valid_view_change(&self, req: &ViewChangeReq) -> bool {
        if self.cache.is_existing_view_change(req) || Some(req.idx) == self.my_idx {
            return false;
        }
        if req.height < self.highest.height || req.view <= self.timer.view() {
            return false;
        }
        if req.height == self.highest.height && req.block_hash != self.highest.hash() {
            return false;
        }
        if req.height <= self.highest.height
            && req.height != BlockHeight::new(0)
            && self.chain.block_at(req.height).is_none()
        {
            return false;
        }
        self.sealer_set
            .get(req.idx)
            .is_some_and(|signer| req.is_correctly_signed(signer))
    }

    fn on_receive_view_change(&mut self, req: ViewChangeReq, envelope: &PacketEnvelope, now: Instant) {
        Event::ReceiveViewChange(ReceiveViewChangeEvent {
            timestamp: SystemTime::now(),
            origin: envelope.sender,
            view: req.view,
            height: req.height,
        })
        .publish(&self.event_publisher);

        // A sealer far behind in views is sent this replica's own request directly.
        if req.view + 1 < self.timer.to_view() && envelope.sender_index == req.idx {
            if let Some(my_idx) = self.my_idx {
                let mine = ViewChangeReq::new(&self.config.keypair, &self.highest, self.timer.to_view(), my_idx);
                self.router
                    .send_direct(&envelope.sender, PacketKind::ViewChangeReq, encode(&mine));
            }
        }

        let valid = self.is_valid_view_change(&req);
        self.forward_if_needed(envelope, valid, &req, PacketKind::ViewChangeReq, None);
        if !valid {
            return;
        }

        self.note_view(&req);
        let (view, idx) = (req.view, req.idx);
        self.cache.add_view_change(req);
        self.cache.limit_view_changes_from(idx, MAX_VIEW_CHANGES_PER_SIGNER);

        if view == self.timer.to_view() {
            self.check_and_change_view(now);
        } else if let Some(lowest) = self.cache.can_trigger_view_change(
            self.sealer_set.max_faulty(),
            self.timer.to_view(),
            self.highest.height,
            self.consensus_height,
        ) {
            log::debug!("More than f sealers want view {} or above, catching up", lowest);
            self.timer.set_to_view(lowest - 1);
            self.timer.fast_view_change();
        }
    }

    /* ↓↓↓ Partial blocks ↓↓↓ */

    fn on_receive_partial_prepare(
        &mut self,
        prepare: PartialPrepareReq,
        partial_block: PartialBlock,
        envelope: PacketEnvelope,
        now: Instant,
    ) -> Result<(), FatalError> {
        if !prepare.is_consistent() {
            log::debug!("Dropped an inconsistent partial prepare from {}", envelope.sender_endpoint);
            return Ok(());
        }
        Event::ReceivePrepare(ReceivePrepareEvent {
            timestamp: SystemTime::now(),
            origin: envelope.sender,
            height: prepare.height,
            view: prepare.view,
            block: prepare.block_hash,
        })
        .publish(&self.event_publisher);

        let result = self.is_valid_prepare(&prepare.msg);
        match result {
            CheckResult::Invalid => Ok(()),
            CheckResult::Future => {
                if let Some(full) = into_prepare(&prepare, partial_block) {
                    self.forward_if_needed(&envelope, true, &full.msg, PacketKind::PrepareReq, Some(encode(&full)));
                    self.handle_checked_prepare(full, CheckResult::Future, now)?;
                }
                Ok(())
            }
            CheckResult::Valid => {
                if !self.partials.add_pending(prepare.clone(), partial_block.clone()) {
                    return Ok(());
                }
                let missing = partial_block.missing_indices();
                if missing.is_empty() {
                    self.partials.clear_pending();
                    let Some(full) = into_prepare(&prepare, partial_block) else {
                        return Ok(());
                    };
                    self.forward_if_needed(&envelope, true, &full.msg, PacketKind::PrepareReq, Some(encode(&full)));
                    return self.handle_checked_prepare(full, CheckResult::Valid, now);
                }

                let Some(leader) = self.sealer_set.get(prepare.idx).copied() else {
                    return Ok(());
                };
                let request = GetMissedTxs {
                    block_hash: prepare.block_hash,
                    indices: missing.clone(),
                };
                self.router.send_direct(&leader, PacketKind::GetMissedTxs, encode(&request));
                Event::RequestMissedTxs(RequestMissedTxsEvent {
                    timestamp: SystemTime::now(),
                    leader,
                    block: prepare.block_hash,
                    missing: missing.len(),
                })
                .publish(&self.event_publisher);

                self.partials
                    .add_forward(prepare.block_hash, prepare.height, envelope, self.highest.height);
                Ok(())
            }
        }
    }

    fn on_receive_get_missed_txs(&mut self, req: GetMissedTxs, envelope: &PacketEnvelope) {
        if let Some(missed) = self.partials.fetch_missed_txs(&req) {
            log::debug!(
                "Sending {} missed transactions to {}",
                missed.transactions.len(),
                envelope.sender_endpoint
            );
            self.router
                .send_direct(&envelope.sender, PacketKind::MissedTxs, encode(&missed));
        }
    }

    fn on_receive_missed_txs(&mut self, missed: MissedTxs, now: Instant) -> Result<(), FatalError> {
        let Some(full) = self.partials.fill(&missed) else {
            return Ok(());
        };
        if let Some(envelope) = self.partials.take_forward(&full.block_hash) {
            self.forward_if_needed(&envelope, true, &full.msg, PacketKind::PrepareReq, Some(encode(&full)));
        }
        let result = self.is_valid_prepare(&full.msg);
        self.handle_checked_prepare(full, result, now)
    }

    /* ↓↓↓ Housekeeping ↓↓↓ */

    fn replay_future_prepare(&mut self, now: Instant) -> Result<(), FatalError> {
        let Some(view) = self.cache.future_prepare(self.consensus_height).map(|req| req.view) else {
            return Ok(());
        };
        if view > self.timer.view() {
            return Ok(());
        }
        let Some(req) = self.cache.remove_future_prepare(self.consensus_height) else {
            return Ok(());
        };
        if view < self.timer.view() {
            return Ok(());
        }
        log::debug!("Replaying the future prepare for height {}", req.height);
        let result = self.is_valid_prepare(&req.msg);
        self.handle_checked_prepare(req, result, now)
    }

    fn collect_garbage(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_garbage_collection) < self.config.garbage_collection_interval {
            return;
        }
        self.cache.collect_garbage(
            self.highest.height,
            self.config.cache_retention_margin,
            self.config.future_block_window,
        );
        self.partials.clear_forwards();
        self.last_garbage_collection = now;
        log::trace!(
            "Collected garbage: {} signs, {} commits, {} view changes, {} future prepares held",
            self.cache.sign_pool_len(),
            self.cache.commit_pool_len(),
            self.cache.view_change_pool_len(),
            self.cache.future_prepare_count()
        );
    }

    fn publish_status(&self) {
        let Ok(mut status) = self.status.write() else {
            return;
        };
        status.node_index = self.my_idx;
        status.sealer_count = self.sealer_set.len();
        status.quorum = self.quorum();
        status.consensus_height = self.consensus_height;
        status.highest_height = self.highest.height;
        status.highest_hash = self.highest.hash();
        status.connected_nodes = self.router.sessions().len();
        status.current_view = self.timer.view();
        status.to_view = self.timer.to_view();
        status.leader_failed = self.timer.leader_failed();
        status.change_cycle = self.timer.change_cycle();
        status.view_state = self.timer.state();
        status.node_views = self
            .sealer_set
            .iter()
            .filter_map(|sealer| {
                if *sealer == self.config.keypair.public() {
                    Some((*sealer, self.timer.view()))
                } else {
                    self.view_map.get(sealer).map(|view| (*sealer, *view))
                }
            })
            .collect();
        status.traffic = self.router.stats().clone();
    }

    /* ↓↓↓ Helpers ↓↓↓ */

    fn quorum(&self) -> usize {
        self.sealer_set.quorum()
    }

    fn note_view(&mut self, msg: &PBFTMsg) {
        if let Some(sealer) = self.sealer_set.get(msg.idx) {
            self.view_map.insert(*sealer, msg.view);
        }
    }

    fn broadcast<M: BorshSerialize>(&mut self, kind: PacketKind, key: &CryptoHash, msg: &M) -> usize {
        self.router.broadcast(kind, key, encode(msg), &HashSet::new(), 0)
    }

    /// Relay the message in `envelope` if the router decides it should be. `payload` replaces the packet's
    /// payload, which is needed when a partial prepare is relayed as a full prepare.
    fn forward_if_needed(
        &mut self,
        envelope: &PacketEnvelope,
        valid: bool,
        msg: &PBFTMsg,
        kind: PacketKind,
        payload: Option<Vec<u8>>,
    ) {
        if !self
            .router
            .need_forward(valid, &envelope.packet, msg.height, self.highest.height)
        {
            return;
        }
        let origin = self.sealer_set.get(msg.idx).copied();
        let payload = payload.unwrap_or_else(|| envelope.packet.payload.clone());
        self.router
            .forward(envelope, kind, &msg.unique_key(), payload, origin);
    }

    /* ↓↓↓ Accessors for tests ↓↓↓ */

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &RequestCache {
        &self.cache
    }

    #[cfg(test)]
    pub(crate) fn timer(&self) -> &ViewTimer {
        &self.timer
    }

    #[cfg(test)]
    pub(crate) fn consensus_height(&self) -> BlockHeight {
        self.consensus_height
    }

    #[cfg(test)]
    pub(crate) fn highest(&self) -> &BlockHeader {
        &self.highest
    }
}

fn encode<M: BorshSerialize>(msg: &M) -> Vec<u8> {
    // Safety: messages are made up of types whose Borsh serialization does not fail.
    msg.try_to_vec().unwrap()
}

fn decode<M: BorshDeserialize>(envelope: &PacketEnvelope) -> Option<M> {
    match M::try_from_slice(&envelope.packet.payload) {
        Ok(msg) => Some(msg),
        Err(_) => {
            log::debug!(
                "Dropped an undecodable {:?} packet from {}",
                envelope.packet.kind,
                envelope.sender_endpoint
            );
            None
        }
    }
}

/// The conditions under which a replica stops rather than risk voting without a durable record of its
/// commitments.
#[derive(Debug, Clone)]
pub enum FatalError {
    /// The device backing the backup store has less free space than
    /// [`min_free_disk_space`](crate::replica::Configuration::min_free_disk_space).
    InsufficientDiskSpace { available: u64, required: u64 },

    /// Writing the committed prepare to the backup store failed.
    Backup(BackupError),

    /// The backup writer thread is gone.
    BackupWriterDisconnected,
}

impl From<BackupError> for FatalError {
    fn from(value: BackupError) -> Self {
        FatalError::Backup(value)
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::InsufficientDiskSpace {
                available,
                required,
            } => write!(
                f,
                "insufficient disk space: {} bytes available, {} required",
                available, required
            ),
            FatalError::Backup(err) => write!(f, "{}", err),
            FatalError::BackupWriterDisconnected => write!(f, "backup writer disconnected"),
        }
    }
}
