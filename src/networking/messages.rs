/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The transport-level envelope that every message travels in.
//!
//! A [`Packet`] is what the [`Network`](super::network::Network) carries. Its `payload` is the
//! Borsh-encoding of the message named by its `kind`. The `ttl` and `forward_nodes` fields are routing
//! metadata, and are not covered by the signatures inside the payload.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

use crate::types::data_types::NodeIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum PacketKind {
    PrepareReq,
    SignReq,
    CommitReq,
    ViewChangeReq,
    PartialPrepareReq,
    GetMissedTxs,
    MissedTxs,
}

impl PacketKind {
    pub const ALL: [PacketKind; 7] = [
        PacketKind::PrepareReq,
        PacketKind::SignReq,
        PacketKind::CommitReq,
        PacketKind::ViewChangeReq,
        PacketKind::PartialPrepareReq,
        PacketKind::GetMissedTxs,
        PacketKind::MissedTxs,
    ];

    /// Whether packets of this kind are relayed beyond their first hop.
    pub fn is_forwardable(&self) -> bool {
        !matches!(self, PacketKind::GetMissedTxs | PacketKind::MissedTxs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Packet {
    pub kind: PacketKind,
    /// Number of hops the packet may still travel, including the current one.
    pub ttl: u8,
    pub payload: Vec<u8>,
    /// Sealers that the origin could not reach directly, as public key bytes.
    pub forward_nodes: Option<Vec<[u8; 32]>>,
}

impl Packet {
    pub fn new(kind: PacketKind, ttl: u8, payload: Vec<u8>, forward_nodes: Option<Vec<[u8; 32]>>) -> Packet {
        Packet {
            kind,
            ttl,
            payload,
            forward_nodes,
        }
    }

    /// Size of the packet's payload in bytes.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Decode the forward-node list, skipping entries that are not valid public keys.
    pub fn forward_node_keys(&self) -> Vec<VerifyingKey> {
        self.forward_nodes
            .iter()
            .flatten()
            .filter_map(|bytes| VerifyingKey::from_bytes(bytes).ok())
            .collect()
    }
}

/// A received packet, along with what is known about the peer that sent it.
#[derive(Clone, Debug)]
pub struct PacketEnvelope {
    pub packet: Packet,
    pub sender: VerifyingKey,
    /// The sender's position in the sealer set when the packet was received.
    pub sender_index: NodeIndex,
    pub sender_endpoint: String,
}
