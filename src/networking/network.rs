/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use ed25519_dalek::VerifyingKey;

use crate::types::sealer_set::SealerSet;

use super::messages::Packet;

/// A live connection to a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub node_id: VerifyingKey,
    pub endpoint: String,
}

pub trait Network: Clone + Send {
    /// Inform the network provider of the sealer set on wake-up.
    fn init_sealer_set(&mut self, sealer_set: SealerSet);

    /// Inform the network provider that the sealer set has changed.
    fn update_sealer_set(&mut self, sealer_set: SealerSet);

    /// The peers this replica is currently connected to. Must not include this replica.
    fn sessions(&self) -> Vec<Session>;

    /// Send a packet to the specified peer without blocking.
    fn send(&mut self, peer: VerifyingKey, packet: Packet);

    /// Send the same packet to every one of `peers` without blocking.
    fn multicast(&mut self, peers: &[VerifyingKey], packet: Packet);

    /// Receive a packet from any peer. Returns immediately with a None if no packet is available now.
    fn recv(&mut self) -> Option<(Session, Packet)>;
}
