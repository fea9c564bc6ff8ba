/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A read-only snapshot of the engine's state, published on every iteration of the consensus worker and
//! readable from any thread through [`Replica::status`](crate::replica::Replica::status).

use ed25519_dalek::VerifyingKey;

use crate::{
    networking::router::TrafficStats,
    types::data_types::{BlockHeight, CryptoHash, NodeIndex, ViewNumber},
};

use super::view_timer::ViewState;

#[derive(Clone, Debug)]
pub struct ConsensusStatus {
    /// This replica's position in the sealer set, if it is a sealer.
    pub node_index: Option<NodeIndex>,
    pub sealer_count: usize,
    pub quorum: usize,
    /// Height of the block the replica is currently trying to agree on.
    pub consensus_height: BlockHeight,
    pub highest_height: BlockHeight,
    pub highest_hash: CryptoHash,
    /// Number of peers the replica is connected to.
    pub connected_nodes: usize,
    pub current_view: ViewNumber,
    pub to_view: ViewNumber,
    pub leader_failed: bool,
    pub change_cycle: u32,
    pub view_state: ViewState,
    /// Last view seen from every sealer this replica has heard from, itself included.
    pub node_views: Vec<(VerifyingKey, ViewNumber)>,
    /// Outbound traffic counters.
    pub traffic: TrafficStats,
}

impl ConsensusStatus {
    pub(crate) fn new(highest_height: BlockHeight, highest_hash: CryptoHash) -> ConsensusStatus {
        ConsensusStatus {
            node_index: None,
            sealer_count: 0,
            quorum: 0,
            consensus_height: highest_height + 1,
            highest_height,
            highest_hash,
            connected_nodes: 0,
            current_view: ViewNumber::init(),
            to_view: ViewNumber::init(),
            leader_failed: false,
            change_cycle: 0,
            view_state: ViewState::Stable,
            node_views: Vec::new(),
            traffic: TrafficStats::default(),
        }
    }

    /// Last view seen from `sealer`, if any.
    pub fn view_of(&self, sealer: &VerifyingKey) -> Option<ViewNumber> {
        self.node_views
            .iter()
            .find(|(node, _)| node == sealer)
            .map(|(_, view)| *view)
    }
}
