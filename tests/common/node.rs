use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ed25519_dalek::{SigningKey, VerifyingKey};
use pbft_rs::{
    events::{FinalizeBlockEvent, ProposeEvent, StartViewEvent},
    pbft::status::ConsensusStatus,
    replica::{Configuration, Replica, ReplicaSpec},
    types::{
        block::Transaction,
        data_types::{BlockHeight, CryptoHash, ViewNumber},
        sealer_set::SealerSet,
    },
};

use crate::common::{
    ledger::{HashExecutor, Ledger, MemTxPool, NoSync},
    logging::{first_seven_base64_chars, log_with_context},
    mem_db::MemDB,
    network::NetworkStub,
};

/// Things the Nodes will have in common:
/// - Initial Sealer Set.
/// - Configuration, apart from the keypair.
///
/// Things that they will differ in:
/// - Ledger and transaction pool.
/// - Network instance.
/// - KVStore.
/// - Keypair.
pub(crate) struct Node {
    verifying_key: VerifyingKey,
    ledger: Ledger,
    tx_pool: Arc<MemTxPool>,
    views_entered: Arc<Mutex<Vec<ViewNumber>>>,
    replica: Replica,
}

impl Node {
    pub(crate) fn new(keypair: SigningKey, network: NetworkStub, sealer_set: SealerSet, enable_partial_block: bool) -> Node {
        let verifying_key = keypair.verifying_key();
        let ledger = Ledger::new(sealer_set);
        let tx_pool = MemTxPool::new();
        let views_entered = Arc::new(Mutex::new(Vec::new()));

        let configuration = Configuration::builder()
            .me(keypair)
            .empty_block_generation_time(Duration::from_millis(300))
            .min_block_generation_time(Duration::from_millis(50))
            .omit_empty_block(false)
            .enable_partial_block(enable_partial_block)
            .garbage_collection_interval(Duration::from_secs(5))
            .log_events(false)
            .build();

        let replica = ReplicaSpec::builder()
            .network(network)
            .kv_store(MemDB::new())
            .executor(HashExecutor)
            .chain(ledger.clone())
            .tx_pool(tx_pool.clone())
            .block_sync(NoSync)
            .configuration(configuration)
            .on_propose(propose_handler(verifying_key))
            .on_start_view(start_view_handler(verifying_key, views_entered.clone()))
            .on_finalize_block(finalize_block_handler(verifying_key))
            .build()
            .start()
            .expect("Replica failed to start");

        Node {
            verifying_key,
            ledger,
            tx_pool,
            views_entered,
            replica,
        }
    }

    pub(crate) fn submit_transaction(&self, transaction: Transaction) {
        self.tx_pool.submit(transaction);
    }

    pub(crate) fn height(&self) -> BlockHeight {
        self.ledger.height()
    }

    pub(crate) fn block_hashes(&self) -> Vec<CryptoHash> {
        self.ledger.hashes()
    }

    pub(crate) fn committed_transactions(&self) -> Vec<Transaction> {
        self.ledger.transactions()
    }

    pub(crate) fn signature_counts(&self) -> Vec<usize> {
        self.ledger.signature_counts()
    }

    pub(crate) fn views_entered(&self) -> Vec<ViewNumber> {
        self.views_entered.lock().unwrap().clone()
    }

    pub(crate) fn status(&self) -> ConsensusStatus {
        self.replica.status()
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.replica.fatal_error().is_none()
    }

    pub(crate) fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }
}

fn propose_handler(verifying_key: VerifyingKey) -> impl Fn(&ProposeEvent) + Send + 'static {
    move |propose_event| {
        log_with_context(
            &verifying_key.to_bytes(),
            &format!(
                "Proposed, height: {}, view: {}, block hash: {}, transactions: {}, partial: {}",
                propose_event.height,
                propose_event.view,
                first_seven_base64_chars(&propose_event.block.bytes()),
                propose_event.tx_count,
                propose_event.partial,
            ),
        );
    }
}

fn start_view_handler(
    verifying_key: VerifyingKey,
    views_entered: Arc<Mutex<Vec<ViewNumber>>>,
) -> impl Fn(&StartViewEvent) + Send + 'static {
    move |start_view_event| {
        views_entered.lock().unwrap().push(start_view_event.view);
        log_with_context(
            &verifying_key.to_bytes(),
            &format!(
                "Started view {}, leader: {}",
                start_view_event.view,
                start_view_event
                    .leader
                    .map(|leader| first_seven_base64_chars(&leader.to_bytes()))
                    .unwrap_or_else(|| String::from("none")),
            ),
        );
    }
}

fn finalize_block_handler(verifying_key: VerifyingKey) -> impl Fn(&FinalizeBlockEvent) + Send + 'static {
    move |finalize_block_event| {
        log_with_context(
            &verifying_key.to_bytes(),
            &format!(
                "Finalized Block, height: {}, block hash: {}, transactions: {}, signatures: {}",
                finalize_block_event.height,
                first_seven_base64_chars(&finalize_block_event.block.bytes()),
                finalize_block_event.tx_count,
                finalize_block_event.signatures,
            ),
        );
    }
}

/// Poll `condition` every 100 ms until it holds, panicking if it does not hold within `timeout`.
pub(crate) fn wait_until(timeout: Duration, what: &str, condition: impl Fn() -> bool) {
    let start = std::time::Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("Timed out waiting until {}", what);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
