/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Decides which peers a message should reach, and sends it to them.
//!
//! ## Forwarding strategies
//!
//! Sealers are not necessarily all connected to each other, so a sealer that receives a message may
//! have to relay it. The [`BroadcastRouter`] supports two strategies, selected by
//! [`enable_ttl_optimization`](crate::replica::Configuration::enable_ttl_optimization):
//! 1. **TTL flood** (the default): every relay rebroadcasts the message to all of its sealer peers except
//!    the one it heard it from and the message's origin, with the packet's `ttl` decremented. A packet that
//!    arrives with `ttl <= 1` is not relayed.
//! 2. **Forward-node list**: the origin attaches the list of sealers it is not directly connected to. A relay
//!    that is connected to some of the listed sealers sends the message to each of them once, attaching the
//!    part of the list that it cannot reach either.
//!
//! ## Broadcast filter
//!
//! Regardless of strategy, the router remembers which message (by [unique
//! key](crate::pbft::messages::PBFTMsg::unique_key)) of which kind it has sent to which peer, and never
//! sends the same message to the same peer twice. The memory is bounded per `(peer, kind)` pair.
//!
//! ## Traffic statistics
//!
//! Every packet handed to the network is counted in [`TrafficStats`]. The counters are for observability
//! only and have no effect on routing.

use std::collections::{HashMap, HashSet, VecDeque};

use ed25519_dalek::VerifyingKey;

use crate::types::{
    data_types::{BlockHeight, CryptoHash},
    sealer_set::SealerSet,
};

use super::{
    messages::{Packet, PacketEnvelope, PacketKind},
    network::{Network, Session},
};

#[derive(Clone, Copy, Debug)]
pub(crate) struct BroadcastRouterConfiguration {
    pub(crate) me: VerifyingKey,
    pub(crate) enable_ttl_optimization: bool,
    pub(crate) max_ttl: u8,
    pub(crate) filter_capacity: usize,
    pub(crate) forward_height_window: u64,
}

pub(crate) struct BroadcastRouter<N: Network> {
    network: N,
    config: BroadcastRouterConfiguration,
    sealer_set: SealerSet,
    filter: BroadcastFilter,
    stats: TrafficStats,
}

impl<N: Network> BroadcastRouter<N> {
    pub(crate) fn new(
        network: N,
        sealer_set: SealerSet,
        config: BroadcastRouterConfiguration,
    ) -> BroadcastRouter<N> {
        BroadcastRouter {
            network,
            filter: BroadcastFilter::new(config.filter_capacity),
            config,
            sealer_set,
            stats: TrafficStats::default(),
        }
    }

    pub(crate) fn sealer_set(&self) -> &SealerSet {
        &self.sealer_set
    }

    /// Replace the sealer set, informing the network provider if it changed.
    pub(crate) fn update_sealer_set(&mut self, sealer_set: SealerSet) {
        if sealer_set != self.sealer_set {
            self.network.update_sealer_set(sealer_set.clone());
            self.sealer_set = sealer_set;
        }
    }

    pub(crate) fn sessions(&self) -> Vec<Session> {
        self.network.sessions()
    }

    pub(crate) fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    pub(crate) fn clear_broadcast_filter(&mut self) {
        self.filter.clear()
    }

    fn ttl_or_max(&self, ttl: u8) -> u8 {
        if ttl == 0 {
            self.config.max_ttl
        } else {
            ttl
        }
    }

    /// Send a message to a single sealer `peer`, if it is connected and has not been sent the message
    /// already. A `ttl` of 0 stands for the configured maximum.
    ///
    /// Returns whether the message was sent.
    pub(crate) fn send(
        &mut self,
        peer: &VerifyingKey,
        kind: PacketKind,
        key: &CryptoHash,
        payload: Vec<u8>,
        ttl: u8,
        forward_nodes: Option<Vec<[u8; 32]>>,
    ) -> bool {
        if !self.sealer_set.contains(peer) || self.filter.is_marked(peer, kind, key) {
            return false;
        }
        if !self.network.sessions().iter().any(|session| session.node_id == *peer) {
            return false;
        }

        let packet = Packet::new(kind, self.ttl_or_max(ttl), payload, forward_nodes);
        self.stats.record(kind, packet.size(), 1);
        self.network.send(*peer, packet);
        self.filter.mark(peer, kind, key);
        true
    }

    /// Send a one-hop message to a sealer `peer`, bypassing the broadcast filter.
    pub(crate) fn send_direct(&mut self, peer: &VerifyingKey, kind: PacketKind, payload: Vec<u8>) -> bool {
        if !self.sealer_set.contains(peer) {
            return false;
        }
        let packet = Packet::new(kind, 1, payload, None);
        self.stats.record(kind, packet.size(), 1);
        self.network.send(*peer, packet);
        true
    }

    /// Send a message to every connected sealer that has not been sent it already, except those in
    /// `exclude`. Excluded sealers are marked as having been sent the message. A `ttl` of 0 stands for the
    /// configured maximum.
    ///
    /// Returns the number of sealers the message was sent to.
    pub(crate) fn broadcast(
        &mut self,
        kind: PacketKind,
        key: &CryptoHash,
        payload: Vec<u8>,
        exclude: &HashSet<VerifyingKey>,
        ttl: u8,
    ) -> usize {
        let sessions = self.network.sessions();
        let mut recipients = Vec::new();
        for session in &sessions {
            if !self.sealer_set.contains(&session.node_id) {
                continue;
            }
            if self.filter.is_marked(&session.node_id, kind, key) {
                continue;
            }
            self.filter.mark(&session.node_id, kind, key);
            if !exclude.contains(&session.node_id) {
                recipients.push(session.node_id);
            }
        }
        if recipients.is_empty() {
            return 0;
        }

        let forward_nodes = if self.config.enable_ttl_optimization {
            self.forward_nodes(&sessions)
        } else {
            None
        };
        let packet = Packet::new(kind, self.ttl_or_max(ttl), payload, forward_nodes);
        self.stats.record(kind, packet.size(), recipients.len() as u64);
        self.network.multicast(&recipients, packet);
        recipients.len()
    }

    /// The sealers, other than this replica, that are not among `sessions`.
    pub(crate) fn forward_nodes(&self, sessions: &[Session]) -> Option<Vec<[u8; 32]>> {
        let connected: HashSet<VerifyingKey> = sessions.iter().map(|session| session.node_id).collect();
        let unreachable: Vec<[u8; 32]> = self
            .sealer_set
            .iter()
            .filter(|sealer| **sealer != self.config.me && !connected.contains(*sealer))
            .map(|sealer| sealer.to_bytes())
            .collect();
        if unreachable.is_empty() {
            None
        } else {
            Some(unreachable)
        }
    }

    /// Log the sealers this replica is not connected to. Called when a view change starts, since a missing
    /// connection is a common reason for a leader to appear failed.
    pub(crate) fn log_unreachable_sealers(&self) {
        if let Some(unreachable) = self.forward_nodes(&self.network.sessions()) {
            log::warn!(
                "{} of {} sealers are not directly connected",
                unreachable.len(),
                self.sealer_set.len()
            );
        }
    }

    /// Decide whether a received message should be relayed.
    ///
    /// A message is relayed only if:
    /// 1. It was `valid` (or cached as a future message).
    /// 2. The packet is still allowed to travel: with TTL optimization, it carries a non-empty forward-node
    ///    list; without, its `ttl` is above 1.
    /// 3. It is not too old: `msg_height` is above `highest_height`, or less than the configured window
    ///    below it.
    pub(crate) fn need_forward(
        &self,
        valid: bool,
        packet: &Packet,
        msg_height: BlockHeight,
        highest_height: BlockHeight,
    ) -> bool {
        if !packet.kind.is_forwardable() {
            return false;
        }
        let has_forward_nodes = packet.forward_nodes.as_ref().is_some_and(|nodes| !nodes.is_empty());
        if packet.forward_nodes.is_some() && !has_forward_nodes {
            return false;
        }
        if !valid {
            return false;
        }
        if self.config.enable_ttl_optimization {
            if !has_forward_nodes {
                return false;
            }
        } else if packet.ttl <= 1 {
            return false;
        }
        msg_height > highest_height
            || msg_height.distance_below(highest_height) < self.config.forward_height_window
    }

    /// Relay `payload` (a message of `kind` identified by `key`) that arrived in `envelope`. `origin` is the
    /// sealer that created the message, if known.
    pub(crate) fn forward(
        &mut self,
        envelope: &PacketEnvelope,
        kind: PacketKind,
        key: &CryptoHash,
        payload: Vec<u8>,
        origin: Option<VerifyingKey>,
    ) {
        if self.config.enable_ttl_optimization {
            self.forward_by_node_info(envelope, kind, key, payload)
        } else {
            self.forward_by_ttl(envelope, kind, key, payload, origin)
        }
    }

    fn forward_by_ttl(
        &mut self,
        envelope: &PacketEnvelope,
        kind: PacketKind,
        key: &CryptoHash,
        payload: Vec<u8>,
        origin: Option<VerifyingKey>,
    ) {
        let ttl = envelope.packet.ttl.saturating_sub(1);
        if ttl == 0 {
            return;
        }
        let mut exclude = HashSet::new();
        exclude.insert(envelope.sender);
        if let Some(origin) = origin {
            exclude.insert(origin);
        }
        let relayed = self.broadcast(kind, key, payload, &exclude, ttl);
        log::trace!("Relayed {:?} to {} sealers, ttl {}", kind, relayed, ttl);
    }

    fn forward_by_node_info(
        &mut self,
        envelope: &PacketEnvelope,
        kind: PacketKind,
        key: &CryptoHash,
        payload: Vec<u8>,
    ) {
        let listed = envelope.packet.forward_node_keys();
        let connected: HashSet<VerifyingKey> = self
            .network
            .sessions()
            .iter()
            .map(|session| session.node_id)
            .collect();
        let remaining: Vec<[u8; 32]> = listed
            .iter()
            .filter(|node| **node != self.config.me && !connected.contains(*node))
            .map(|node| node.to_bytes())
            .collect();

        for node in listed.iter().filter(|node| connected.contains(*node)) {
            if self.send(node, kind, key, payload.clone(), 1, Some(remaining.clone())) {
                log::trace!("Relayed {:?} by forward-node list, {} nodes left unreached", kind, remaining.len());
            }
        }
    }
}

/// Bounded memory of which messages have been sent to which peer.
struct BroadcastFilter {
    capacity: usize,
    entries: HashMap<(VerifyingKey, PacketKind), SentKeys>,
}

#[derive(Default)]
struct SentKeys {
    keys: HashSet<CryptoHash>,
    order: VecDeque<CryptoHash>,
}

impl BroadcastFilter {
    fn new(capacity: usize) -> BroadcastFilter {
        BroadcastFilter {
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    fn is_marked(&self, peer: &VerifyingKey, kind: PacketKind, key: &CryptoHash) -> bool {
        self.entries
            .get(&(*peer, kind))
            .is_some_and(|sent| sent.keys.contains(key))
    }

    fn mark(&mut self, peer: &VerifyingKey, kind: PacketKind, key: &CryptoHash) {
        let sent = self.entries.entry((*peer, kind)).or_default();
        if !sent.keys.insert(*key) {
            return;
        }
        sent.order.push_back(*key);
        while sent.order.len() > self.capacity {
            if let Some(oldest) = sent.order.pop_front() {
                sent.keys.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear()
    }
}

/// Outbound packet and byte counts, per [`PacketKind`].
#[derive(Clone, Debug, Default)]
pub struct TrafficStats {
    counters: HashMap<PacketKind, PacketCounter>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketCounter {
    pub packets: u64,
    pub bytes: u64,
}

impl TrafficStats {
    fn record(&mut self, kind: PacketKind, size: u64, recipients: u64) {
        let counter = self.counters.entry(kind).or_default();
        counter.packets += recipients;
        counter.bytes += size * recipients;
    }

    pub fn get(&self, kind: PacketKind) -> PacketCounter {
        self.counters.get(&kind).copied().unwrap_or_default()
    }

    pub fn total(&self) -> PacketCounter {
        self.counters.values().fold(PacketCounter::default(), |total, counter| PacketCounter {
            packets: total.packets + counter.packets,
            bytes: total.bytes + counter.bytes,
        })
    }
}
