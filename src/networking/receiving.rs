/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The poller thread, which takes packets off the [`Network`] and queues them for the consensus worker.
//!
//! The poller does only cheap work:
//! 1. It drops packets if this replica is not a sealer, or if the sender is not one.
//! 2. It decodes partial prepares and resolves their transaction hashes against the
//!    [`TxPool`](crate::pluggables::TxPool), so that the worker does not have to.
//! 3. It pushes what is left onto a bounded queue. If the queue is full, the packet is dropped with a
//!    warning. Consensus recovers from dropped packets through view changes.

use std::{
    sync::{
        mpsc::{Receiver, SyncSender, TryRecvError, TrySendError},
        Arc, RwLock,
    },
    thread::{self, JoinHandle},
};

use borsh::BorshDeserialize;
use ed25519_dalek::VerifyingKey;

use crate::{
    pbft::{messages::PartialPrepareReq, partial_block::PartialBlock},
    pluggables::TxPool,
    types::sealer_set::SealerSet,
};

use super::{
    messages::{PacketEnvelope, PacketKind},
    network::Network,
};

/// A packet as queued for the consensus worker.
pub(crate) enum InboundMessage {
    /// A prepare, sign, commit, or view change, still encoded.
    Consensus(PacketEnvelope),
    /// A decoded partial prepare, along with the block as far as the local transaction pool could rebuild
    /// it.
    PartialPrepare {
        envelope: PacketEnvelope,
        prepare: PartialPrepareReq,
        partial_block: PartialBlock,
    },
    GetMissedTxs(PacketEnvelope),
    MissedTxs(PacketEnvelope),
}

/// Spawn the poller thread.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    me: VerifyingKey,
    sealer_set: Arc<RwLock<SealerSet>>,
    tx_pool: Arc<dyn TxPool>,
    to_worker: SyncSender<InboundMessage>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        let Some((session, packet)) = network.recv() else {
            thread::yield_now();
            continue;
        };

        let sender_index = match sealer_set.read() {
            Ok(sealer_set) => {
                if !sealer_set.contains(&me) {
                    continue;
                }
                match sealer_set.index_of(&session.node_id) {
                    Some(idx) => idx,
                    None => continue,
                }
            }
            Err(_) => return,
        };

        let kind = packet.kind;
        let envelope = PacketEnvelope {
            packet,
            sender: session.node_id,
            sender_index,
            sender_endpoint: session.endpoint,
        };

        let msg = match kind {
            PacketKind::PartialPrepareReq => {
                let Ok(prepare) = PartialPrepareReq::try_from_slice(&envelope.packet.payload) else {
                    log::debug!("Dropped an undecodable partial prepare from {}", envelope.sender_endpoint);
                    continue;
                };
                let partial_block = PartialBlock::resolve(&prepare, tx_pool.as_ref());
                InboundMessage::PartialPrepare {
                    envelope,
                    prepare,
                    partial_block,
                }
            }
            PacketKind::GetMissedTxs => InboundMessage::GetMissedTxs(envelope),
            PacketKind::MissedTxs => InboundMessage::MissedTxs(envelope),
            PacketKind::PrepareReq
            | PacketKind::SignReq
            | PacketKind::CommitReq
            | PacketKind::ViewChangeReq => InboundMessage::Consensus(envelope),
        };

        match to_worker.try_send(msg) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => {
                log::warn!("Message queue is full, dropped a {:?} packet", kind)
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    })
}
