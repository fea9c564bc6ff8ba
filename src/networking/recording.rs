/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! An in-process [`Network`] that records what is sent through it, for unit tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use ed25519_dalek::VerifyingKey;

use crate::types::sealer_set::SealerSet;

use super::{
    messages::{Packet, PacketKind},
    network::{Network, Session},
};

#[derive(Clone)]
pub(crate) struct RecordingNetwork {
    sessions: Arc<Mutex<Vec<Session>>>,
    sent: Arc<Mutex<Vec<(VerifyingKey, Packet)>>>,
    inbox: Arc<Mutex<VecDeque<(Session, Packet)>>>,
    sealer_set_updates: Arc<Mutex<Vec<SealerSet>>>,
}

impl RecordingNetwork {
    /// Create a network where this replica is connected to `peers`.
    pub(crate) fn new(peers: &[VerifyingKey]) -> RecordingNetwork {
        let sessions = peers
            .iter()
            .enumerate()
            .map(|(i, peer)| Session {
                node_id: *peer,
                endpoint: format!("127.0.0.1:{}", 30300 + i),
            })
            .collect();
        RecordingNetwork {
            sessions: Arc::new(Mutex::new(sessions)),
            sent: Arc::new(Mutex::new(Vec::new())),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            sealer_set_updates: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn session_of(&self, peer: &VerifyingKey) -> Session {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .find(|session| session.node_id == *peer)
            .cloned()
            .unwrap_or(Session {
                node_id: *peer,
                endpoint: String::from("unknown"),
            })
    }

    pub(crate) fn disconnect(&self, peer: &VerifyingKey) {
        self.sessions
            .lock()
            .unwrap()
            .retain(|session| session.node_id != *peer);
    }

    /// Queue a packet to be returned by `recv`.
    pub(crate) fn deliver(&self, from: &VerifyingKey, packet: Packet) {
        let session = self.session_of(from);
        self.inbox.lock().unwrap().push_back((session, packet));
    }

    /// Take every `(recipient, packet)` pair sent so far.
    pub(crate) fn take_sent(&self) -> Vec<(VerifyingKey, Packet)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Take the packets of `kind` sent so far, dropping every other packet.
    pub(crate) fn take_sent_of(&self, kind: PacketKind) -> Vec<(VerifyingKey, Packet)> {
        self.take_sent()
            .into_iter()
            .filter(|(_, packet)| packet.kind == kind)
            .collect()
    }

    pub(crate) fn sealer_set_updates(&self) -> usize {
        self.sealer_set_updates.lock().unwrap().len()
    }
}

impl Network for RecordingNetwork {
    fn init_sealer_set(&mut self, _: SealerSet) {}

    fn update_sealer_set(&mut self, sealer_set: SealerSet) {
        self.sealer_set_updates.lock().unwrap().push(sealer_set);
    }

    fn sessions(&self) -> Vec<Session> {
        self.sessions.lock().unwrap().clone()
    }

    fn send(&mut self, peer: VerifyingKey, packet: Packet) {
        self.sent.lock().unwrap().push((peer, packet));
    }

    fn multicast(&mut self, peers: &[VerifyingKey], packet: Packet) {
        let mut sent = self.sent.lock().unwrap();
        for peer in peers {
            sent.push((*peer, packet.clone()));
        }
    }

    fn recv(&mut self) -> Option<(Session, Packet)> {
        self.inbox.lock().unwrap().pop_front()
    }
}
