/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a replica.
//!
//! A replica is a process that takes part in agreeing on the blocks of a permissioned chain. Replicas whose
//! public keys are in the [sealer set](crate::types::sealer_set::SealerSet) vote in consensus and take turns
//! proposing blocks. Replicas that are not sealers start up normally, but drop every consensus message
//! until the chain makes them sealers.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](ReplicaSpec) with:
//!   1. `ReplicaSpec::builder` to construct a `ReplicaSpecBuilder`,
//!   2. The setters of the `ReplicaSpecBuilder`, and
//!   3. The `ReplicaSpecBuilder::build` method to construct a [ReplicaSpec],
//! - The function to [start](ReplicaSpec::start) a [Replica] given its specification,
//! - [The type](Replica) which keeps the replica alive.
//!
//! ## Starting a replica
//!
//! ```ignore
//! let replica =
//!     ReplicaSpec::builder()
//!     .network(network)
//!     .kv_store(kv_store)
//!     .executor(executor)
//!     .chain(chain)
//!     .tx_pool(tx_pool)
//!     .block_sync(block_sync)
//!     .configuration(configuration)
//!     .on_commit_block(|height, tx_count, change_cycle| { ... })
//!     .on_finalize_block(finalize_block_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//!
//! The required setters are for providing the trait implementations required to run a replica:
//! - `.network(...)`
//! - `.kv_store(...)`
//! - `.executor(...)`
//! - `.chain(...)`
//! - `.tx_pool(...)`
//! - `.block_sync(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! Lifecycle hooks, called synchronously on the consensus worker thread (see [hooks](crate::hooks)):
//! - `.on_commit_block(...)`
//! - `.on_consensus_timeout(...)`
//! - `.on_view_change(...)`
//! - `.on_next_leader_notify(...)`
//! - `.on_fatal(...)`
//!
//! Handlers for events from [crate::events], called on the event bus thread:
//! - `.on_propose(...)`
//! - `.on_sign(...)`
//! - `.on_commit(...)`
//! - `.on_send_view_change(...)`
//! - `.on_receive_prepare(...)`
//! - `.on_receive_sign(...)`
//! - `.on_receive_commit(...)`
//! - `.on_receive_view_change(...)`
//! - `.on_start_view(...)`
//! - `.on_view_timeout(...)`
//! - `.on_finalize_block(...)`
//! - `.on_request_missed_txs(...)`
//!
//! The replica's [configuration](Configuration) is also built with the builder pattern. Only the keypair
//! is required:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(keypair)
//!     .empty_block_generation_time(Duration::from_secs(1))
//!     .enable_partial_block(true)
//!     .build()
//! ```

use std::{
    collections::HashSet,
    sync::{
        mpsc::{self, Sender},
        Arc, Mutex, PoisonError, RwLock,
    },
    thread::JoinHandle,
    time::Duration,
};

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::{
    backup::{pluggables::KVStore, Backup, MIN_FREE_DISK_SPACE},
    event_bus::*,
    events::*,
    hooks::*,
    networking::{
        network::Network,
        receiving::start_polling,
        router::{BroadcastRouter, BroadcastRouterConfiguration},
    },
    pbft::{
        implementation::{Collaborators, FatalError, PBFTConfiguration, PBFTEngine},
        status::ConsensusStatus,
        view_timer::{ViewTimer, ViewTimerConfiguration},
    },
    pluggables::{BlockSync, ChainStorage, Executor, TxPool},
    types::{
        block::Block,
        crypto_primitives::Keypair,
        data_types::{BlockHeight, CryptoHash},
    },
};

/// Stores the user-defined parameters required to start the replica.
///
/// ## Timing
///
/// A leader seals a block once [`min_block_generation_time`](Self::min_block_generation_time) has passed
/// since the last block and there are pending transactions, or once
/// [`empty_block_generation_time`](Self::empty_block_generation_time) has passed, whichever comes first.
/// A view times out after three times `empty_block_generation_time`, multiplied by
/// `backoff_factor ^ change_cycle`, where `change_cycle` counts the consecutive failed views up to
/// `max_change_cycle`.
///
/// ## Log Events
///
/// pbft_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed onto a
/// terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`

    Optional (defaults in parentheses):
    - `.empty_block_generation_time(...)` (1 s)
    - `.min_block_generation_time(...)` (500 ms)
    - `.max_block_transactions(...)` (1000)
    - `.omit_empty_block(...)` (true)
    - `.enable_ttl_optimization(...)` (false)
    - `.enable_partial_block(...)` (false)
    - `.max_ttl(...)` (3)
    - `.message_queue_capacity(...)` (10 000)
    - `.broadcast_filter_capacity(...)` (1024)
    - `.garbage_collection_interval(...)` (60 s)
    - `.cache_retention_margin(...)` (1)
    - `.future_block_window(...)` (10)
    - `.forward_height_window(...)` (10)
    - `.backoff_factor(...)` (1.5)
    - `.max_change_cycle(...)` (20)
    - `.min_change_cycle(...)` (1)
    - `.min_free_disk_space(...)` (100 MiB)
    - `.log_events(...)` (true)
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the replica's keypair, used to sign messages. Required."))]
    pub me: SigningKey,
    #[builder(
        default = Duration::from_secs(1),
        setter(doc = "Set the longest time a leader waits before sealing a block, empty or not. Optional.")
    )]
    pub empty_block_generation_time: Duration,
    #[builder(
        default = Duration::from_millis(500),
        setter(doc = "Set the shortest time a leader waits before sealing a block with pending transactions. Optional.")
    )]
    pub min_block_generation_time: Duration,
    #[builder(
        default = 1000,
        setter(doc = "Set the maximum number of transactions in a sealed block. Optional.")
    )]
    pub max_block_transactions: usize,
    #[builder(
        default = true,
        setter(doc = "Pass on a round instead of sealing an empty block? Optional.")
    )]
    pub omit_empty_block: bool,
    #[builder(
        default = false,
        setter(doc = "Relay broadcasts by forward-node lists instead of by TTL? Optional.")
    )]
    pub enable_ttl_optimization: bool,
    #[builder(
        default = false,
        setter(doc = "Propose blocks by transaction hash instead of by transaction? Optional.")
    )]
    pub enable_partial_block: bool,
    #[builder(
        default = 3,
        setter(doc = "Set the number of hops a broadcast may travel when relaying by TTL. Optional.")
    )]
    pub max_ttl: u8,
    #[builder(
        default = 10_000,
        setter(doc = "Set the number of received messages that may wait for the consensus worker. Optional.")
    )]
    pub message_queue_capacity: usize,
    #[builder(
        default = 1024,
        setter(doc = "Set the number of message keys remembered per peer and message type for deduplication. Optional.")
    )]
    pub broadcast_filter_capacity: usize,
    #[builder(
        default = Duration::from_secs(60),
        setter(doc = "Set the interval between sweeps of the message caches. Optional.")
    )]
    pub garbage_collection_interval: Duration,
    #[builder(
        default = 1,
        setter(doc = "Set the number of finalized heights whose messages survive a sweep. Optional.")
    )]
    pub cache_retention_margin: u64,
    #[builder(
        default = 10,
        setter(doc = "Set how many heights ahead of the chain a future prepare may be. Optional.")
    )]
    pub future_block_window: u64,
    #[builder(
        default = 10,
        setter(doc = "Set how many heights behind the chain a message may be and still be relayed. Optional.")
    )]
    pub forward_height_window: u64,
    #[builder(
        default = 1.5,
        setter(doc = "Set the factor by which the view timeout grows with every consecutive failed view. Optional.")
    )]
    pub backoff_factor: f64,
    #[builder(
        default = 20,
        setter(doc = "Set the number of consecutive failed views after which the view timeout stops growing. Optional.")
    )]
    pub max_change_cycle: u32,
    #[builder(
        default = 1,
        setter(doc = "Set the backoff cycle a replica falls back to after skipping views to catch up. Optional.")
    )]
    pub min_change_cycle: u32,
    #[builder(
        default = MIN_FREE_DISK_SPACE,
        setter(doc = "Set the free space, in bytes, that the backup store must have for the replica to start. Optional.")
    )]
    pub min_free_disk_space: u64,
    #[builder(default = true, setter(doc = "Enable logging? Optional."))]
    pub log_events: bool,
}

impl From<Configuration> for (PBFTConfiguration, ViewTimerConfiguration, BroadcastRouterConfiguration) {
    fn from(config: Configuration) -> Self {
        let keypair = Keypair::new(config.me);
        let router_config = BroadcastRouterConfiguration {
            me: keypair.public(),
            enable_ttl_optimization: config.enable_ttl_optimization,
            max_ttl: config.max_ttl,
            filter_capacity: config.broadcast_filter_capacity,
            forward_height_window: config.forward_height_window,
        };
        let timer_config = ViewTimerConfiguration {
            view_timeout: config.empty_block_generation_time * 3,
            backoff_factor: config.backoff_factor,
            max_change_cycle: config.max_change_cycle,
            min_change_cycle: config.min_change_cycle,
        };
        let pbft_config = PBFTConfiguration {
            keypair,
            empty_block_generation_time: config.empty_block_generation_time,
            min_block_generation_time: config.min_block_generation_time,
            max_block_transactions: config.max_block_transactions,
            omit_empty_block: config.omit_empty_block,
            enable_partial_block: config.enable_partial_block,
            garbage_collection_interval: config.garbage_collection_interval,
            cache_retention_margin: config.cache_retention_margin,
            future_block_window: config.future_block_window,
        };
        (pbft_config, timer_config, router_config)
    }
}

/// Stores all necessary parameters and trait implementations required to run the [Replica].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ReplicaSpec]. On the builder call the following methods to construct a valid [ReplicaSpec].

    Required:
    - `.network(...)`
    - `.kv_store(...)`
    - `.executor(...)`
    - `.chain(...)`
    - `.tx_pool(...)`
    - `.block_sync(...)`
    - `.configuration(...)`

    Optional:
    - `.on_commit_block(...)`
    - `.on_consensus_timeout(...)`
    - `.on_view_change(...)`
    - `.on_next_leader_notify(...)`
    - `.on_fatal(...)`
    - `.on_propose(...)`
    - `.on_sign(...)`
    - `.on_commit(...)`
    - `.on_send_view_change(...)`
    - `.on_receive_prepare(...)`
    - `.on_receive_sign(...)`
    - `.on_receive_commit(...)`
    - `.on_receive_view_change(...)`
    - `.on_start_view(...)`
    - `.on_view_timeout(...)`
    - `.on_finalize_block(...)`
    - `.on_request_missed_txs(...)`
"))]
pub struct ReplicaSpec<K: KVStore, N: Network + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the key-value store in which the committed prepare is backed up. The argument must implement the [KVStore](crate::backup::pluggables::KVStore) trait. Required."))]
    kv_store: K,
    #[builder(setter(
        transform = |executor: impl Executor + 'static| Box::new(executor) as Box<dyn Executor>,
        doc = "Set the block executor. The argument must implement the [Executor](crate::pluggables::Executor) trait. Required."
    ))]
    executor: Box<dyn Executor>,
    #[builder(setter(
        transform = |chain: impl ChainStorage + 'static| Box::new(chain) as Box<dyn ChainStorage>,
        doc = "Set the storage of finalized blocks. The argument must implement the [ChainStorage](crate::pluggables::ChainStorage) trait. Required."
    ))]
    chain: Box<dyn ChainStorage>,
    #[builder(setter(doc = "Set the transaction pool, which is shared with the poller thread. Required."))]
    tx_pool: Arc<dyn TxPool>,
    #[builder(setter(
        transform = |block_sync: impl BlockSync + 'static| Box::new(block_sync) as Box<dyn BlockSync>,
        doc = "Set the block synchronization component. The argument must implement the [BlockSync](crate::pluggables::BlockSync) trait. Required."
    ))]
    block_sync: Box<dyn BlockSync>,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a replica. Required."))]
    configuration: Configuration,
    // Lifecycle hooks
    #[builder(default, setter(transform = |hook: impl Fn(BlockHeight, usize, u32) + Send + 'static| Some(Box::new(hook) as CommitBlockHook),
    doc = "Register a hook to be called after a block is appended to the chain. Optional."))]
    on_commit_block: Option<CommitBlockHook>,
    #[builder(default, setter(transform = |hook: impl Fn(usize) + Send + 'static| Some(Box::new(hook) as ConsensusTimeoutHook),
    doc = "Register a hook to be called when a view times out with a proposal pending. Optional."))]
    on_consensus_timeout: Option<ConsensusTimeoutHook>,
    #[builder(default, setter(transform = |hook: impl Fn() + Send + 'static| Some(Box::new(hook) as ViewChangeHook),
    doc = "Register a hook to be called whenever the replica asks for a view change. Optional."))]
    on_view_change: Option<ViewChangeHook>,
    #[builder(default, setter(transform = |hook: impl Fn(&HashSet<CryptoHash>) + Send + 'static| Some(Box::new(hook) as NextLeaderNotifyHook),
    doc = "Register a hook to be called on the next leader with the transactions of the current leader's block. Optional."))]
    on_next_leader_notify: Option<NextLeaderNotifyHook>,
    #[builder(default, setter(transform = |hook: impl Fn(&FatalError) + Send + 'static| Some(Box::new(hook) as FatalHook),
    doc = "Register a hook to be called if consensus stops on a fatal error. Optional."))]
    on_fatal: Option<FatalHook>,
    // Event handlers
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeEvent>),
    doc = "Register a handler closure to be invoked after the replica proposes a block. Optional."))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SignEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SignEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a sign request. Optional."))]
    on_sign: Option<HandlerPtr<SignEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a commit request. Optional."))]
    on_commit: Option<HandlerPtr<CommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SendViewChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SendViewChangeEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a view change request. Optional."))]
    on_send_view_change: Option<HandlerPtr<SendViewChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceivePrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceivePrepareEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a prepare. Optional."))]
    on_receive_prepare: Option<HandlerPtr<ReceivePrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveSignEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveSignEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a sign request. Optional."))]
    on_receive_sign: Option<HandlerPtr<ReceiveSignEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveCommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveCommitEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a commit request. Optional."))]
    on_receive_commit: Option<HandlerPtr<ReceiveCommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveViewChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveViewChangeEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a view change request. Optional."))]
    on_receive_view_change: Option<HandlerPtr<ReceiveViewChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartViewEvent>),
    doc = "Register a handler closure to be invoked after the replica enters a new view. Optional."))]
    on_start_view: Option<HandlerPtr<StartViewEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ViewTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ViewTimeoutEvent>),
    doc = "Register a handler closure to be invoked after the replica's view times out. Optional."))]
    on_view_timeout: Option<HandlerPtr<ViewTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FinalizeBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FinalizeBlockEvent>),
    doc = "Register a handler closure to be invoked after the replica appends a block to the chain. Optional."))]
    on_finalize_block: Option<HandlerPtr<FinalizeBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RequestMissedTxsEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RequestMissedTxsEvent>),
    doc = "Register a handler closure to be invoked after the replica asks a leader for missing transactions. Optional."))]
    on_request_missed_txs: Option<HandlerPtr<RequestMissedTxsEvent>>,
}

impl<K: KVStore, N: Network + 'static> ReplicaSpec<K, N> {
    /// Starts all threads and channels associated with running a replica, and returns the handles to them in
    /// a [Replica] struct.
    ///
    /// Fails if the backup store does not have
    /// [`min_free_disk_space`](Configuration::min_free_disk_space) bytes available.
    pub fn start(mut self) -> Result<Replica, FatalError> {
        let backup = Backup::open(self.kv_store, self.configuration.min_free_disk_space)?;

        let sealer_set = self.chain.sealer_set();
        self.network.init_sealer_set(sealer_set.clone());
        let highest = self
            .chain
            .block_at(self.chain.current_height())
            .map(|block| block.header)
            .unwrap_or_else(|| Block::genesis().header);

        let log_events = self.configuration.log_events;
        let message_queue_capacity = self.configuration.message_queue_capacity;
        let forward_height_window = self.configuration.forward_height_window;
        let (pbft_config, timer_config, router_config): (
            PBFTConfiguration,
            ViewTimerConfiguration,
            BroadcastRouterConfiguration,
        ) = self.configuration.into();

        let shared_sealer_set = Arc::new(RwLock::new(sealer_set.clone()));
        let status = Arc::new(RwLock::new(ConsensusStatus::new(highest.height, highest.hash())));
        let fatal_error = Arc::new(Mutex::new(None));

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (to_worker, inbound) = mpsc::sync_channel(message_queue_capacity);
        let poller = start_polling(
            self.network.clone(),
            router_config.me,
            shared_sealer_set.clone(),
            self.tx_pool.clone(),
            to_worker,
            poller_shutdown_receiver,
        );

        let event_handlers = EventHandlers::new(
            log_events,
            self.on_propose,
            self.on_sign,
            self.on_commit,
            self.on_send_view_change,
            self.on_receive_prepare,
            self.on_receive_sign,
            self.on_receive_commit,
            self.on_receive_view_change,
            self.on_start_view,
            self.on_view_timeout,
            self.on_finalize_block,
            self.on_request_missed_txs,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let hooks = Hooks {
            on_commit_block: self.on_commit_block,
            on_consensus_timeout: self.on_consensus_timeout,
            on_view_change: self.on_view_change,
            on_next_leader_notify: self.on_next_leader_notify,
            on_fatal: self.on_fatal,
        };

        let engine = PBFTEngine::new(
            pbft_config,
            BroadcastRouter::new(self.network, sealer_set.clone(), router_config),
            ViewTimer::new(timer_config),
            forward_height_window,
            backup,
            Collaborators {
                executor: self.executor,
                chain: self.chain,
                tx_pool: self.tx_pool,
                block_sync: self.block_sync,
            },
            shared_sealer_set,
            status.clone(),
            hooks,
            event_publisher,
        );

        let (worker_shutdown, worker_shutdown_receiver) = mpsc::channel();
        let worker = engine.start(inbound, worker_shutdown_receiver, fatal_error.clone());

        let (event_bus_shutdown, event_bus) = match event_subscriber {
            Some(event_subscriber) => {
                let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
                let event_bus = start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver);
                (Some(event_bus_shutdown), Some(event_bus))
            }
            None => (None, None),
        };

        log::info!(
            "Started replica at height {} with {} sealers",
            highest.height,
            sealer_set.len()
        );

        Ok(Replica {
            status,
            fatal_error,
            poller: Some(poller),
            poller_shutdown,
            worker: Some(worker),
            worker_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// A handle to the background threads of a pbft_rs replica. When this value is dropped, all background threads
/// are gracefully shut down.
pub struct Replica {
    status: Arc<RwLock<ConsensusStatus>>,
    fatal_error: Arc<Mutex<Option<FatalError>>>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    worker: Option<JoinHandle<()>>,
    worker_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Replica {
    /// Get the latest snapshot of the consensus state.
    pub fn status(&self) -> ConsensusStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get the error that stopped consensus, if consensus has stopped.
    pub fn fatal_error(&self) -> Option<FatalError> {
        self.fatal_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        // The order of shutdown matters. The worker publishes to the event bus and receives from the
        // poller, and treats either channel disconnecting as a reason to stop.

        self.event_bus_shutdown.iter().for_each(|shutdown| {
            let _ = shutdown.send(());
        });
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }

        // The worker may already have stopped on a fatal error.
        let _ = self.worker_shutdown.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
    }
}
