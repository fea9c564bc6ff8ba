use std::time::Duration;

use ed25519_dalek::SigningKey;
use log::LevelFilter;
use pbft_rs::types::{block::Transaction, sealer_set::SealerSet};
use rand_core::OsRng;

mod common;

use crate::common::{
    logging::setup_logger,
    network::mock_network_with_cut_links,
    node::{wait_until, Node},
};

/// Transactions are only in the pool of one replica, so the others must ask the leader for them when they
/// receive partial prepares. The link between the replicas at index 0 and 3 is cut, so their messages to each
/// other are relayed by the rest.
#[test]
fn partial_block_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Create signing keys for 4 replicas.
    let mut csprg = OsRng {};
    let keypairs: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate(&mut csprg)).collect();
    let sealer_set = SealerSet::new(keypairs.iter().map(|kp| kp.verifying_key()).collect());

    // 1.2. Create a mock network connecting the 4 replicas, except 0 with 3.
    let network_stubs = mock_network_with_cut_links(keypairs.iter().map(|kp| kp.verifying_key()), &[(0, 3)]);

    // 1.3. Start all replicas in partial block mode.
    let nodes: Vec<Node> = keypairs
        .into_iter()
        .zip(network_stubs)
        .map(|(keypair, network)| Node::new(keypair, network, sealer_set.clone(), true))
        .collect();

    // 2. Submit 5 transactions to the replica at index 1 only.
    log::debug!("Submitting 5 transactions to the replica at index 1.");
    let transactions: Vec<Transaction> = (0..5u8).map(|i| Transaction::new(vec![i, 42, i])).collect();
    for transaction in &transactions {
        nodes[1].submit_transaction(transaction.clone());
    }

    // 3. Poll until every replica has committed all 5 transactions.
    wait_until(Duration::from_secs(60), "every replica commits the transactions", || {
        nodes.iter().all(|node| {
            let committed = node.committed_transactions();
            transactions.iter().all(|tx| committed.contains(tx))
        })
    });

    // 4. Check that the transactions are committed in the same blocks everywhere.
    let reference = nodes[1].block_hashes();
    for node in &nodes {
        let hashes = node.block_hashes();
        let common_len = reference.len().min(hashes.len());
        assert_eq!(hashes[..common_len], reference[..common_len]);
        assert!(node.is_healthy());
    }
    assert_eq!(nodes[0].status().connected_nodes, 2);
}
