use std::time::Duration;

use ed25519_dalek::SigningKey;
use log::LevelFilter;
use pbft_rs::types::{
    block::Transaction,
    data_types::{BlockHeight, ViewNumber},
    sealer_set::SealerSet,
};
use rand_core::OsRng;

mod common;

use crate::common::{
    logging::setup_logger,
    network::mock_network,
    node::{wait_until, Node},
};

/// The sealer at index 0, which leads the first view at height 1, never starts. The remaining 3 sealers
/// form a quorum, and must change views to make progress.
#[test]
fn view_change_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Create signing keys for 4 replicas.
    let mut csprg = OsRng {};
    let keypairs: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate(&mut csprg)).collect();
    let sealer_set = SealerSet::new(keypairs.iter().map(|kp| kp.verifying_key()).collect());

    // 1.2. Create a mock network connecting the 4 replicas.
    let network_stubs = mock_network(keypairs.iter().map(|kp| kp.verifying_key()));

    // 1.3. Start every replica except the one at index 0.
    let nodes: Vec<Node> = keypairs
        .into_iter()
        .zip(network_stubs)
        .skip(1)
        .map(|(keypair, network)| Node::new(keypair, network, sealer_set.clone(), false))
        .collect();

    // 2. Submit a transaction to one of the live replicas.
    let transaction = Transaction::new(b"view change".to_vec());
    nodes[0].submit_transaction(transaction.clone());

    // 3. Poll until every live replica has finalized a few blocks.
    log::debug!("Polling the chains of the live replicas until they reach height 3.");
    wait_until(Duration::from_secs(90), "the live replicas reach height 3", || {
        nodes.iter().all(|node| node.height() >= BlockHeight::new(3))
    });

    // 4. Check that every live replica left view 0, and that they agree on the chain.
    for node in &nodes {
        assert!(node.views_entered().iter().any(|view| *view > ViewNumber::init()));
        assert!(node.is_healthy());
    }
    let reference = nodes[0].block_hashes();
    for node in &nodes {
        let common_len = reference.len().min(node.block_hashes().len());
        assert_eq!(node.block_hashes()[..common_len], reference[..common_len]);
    }

    // 5. The transaction is eventually committed, since the leader rotates through the live replicas.
    wait_until(Duration::from_secs(60), "the transaction is committed", || {
        nodes
            .iter()
            .all(|node| node.committed_transactions().contains(&transaction))
    });
}
