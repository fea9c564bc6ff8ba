/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events that a replica emits as it runs the protocol.
//!
//! An event for a given action indicates that the action has been completed. Events are delivered to
//! user-defined handlers, registered through the [`ReplicaSpec`](crate::replica::ReplicaSpec) builder, on
//! a separate thread, so handlers never block consensus. If
//! [`log_events`](crate::replica::Configuration::log_events) is set, every event is also printed by a
//! default handler defined in [`logging`](crate::logging).

use std::{
    sync::mpsc::Sender,
    time::{Duration, SystemTime},
};

use ed25519_dalek::VerifyingKey;

use crate::types::data_types::{BlockHeight, CryptoHash, ViewNumber};

pub enum Event {
    // Events that involve broadcasting/sending a message.
    Propose(ProposeEvent),
    Sign(SignEvent),
    Commit(CommitEvent),
    SendViewChange(SendViewChangeEvent),
    // Events that involve receiving a message.
    ReceivePrepare(ReceivePrepareEvent),
    ReceiveSign(ReceiveSignEvent),
    ReceiveCommit(ReceiveCommitEvent),
    ReceiveViewChange(ReceiveViewChangeEvent),
    // Events that change the replica's view or chain.
    StartView(StartViewEvent),
    ViewTimeout(ViewTimeoutEvent),
    FinalizeBlock(FinalizeBlockEvent),
    // Partial-block mode events.
    RequestMissedTxs(RequestMissedTxsEvent),
}

impl Event {
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            // The event bus may already have shut down while the replica is being dropped.
            let _ = event_publisher.send(self);
        }
    }
}

/// The replica, as leader, broadcast a prepare for a block it sealed.
pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub view: ViewNumber,
    pub block: CryptoHash,
    pub tx_count: usize,
    /// Whether the block went out as a partial prepare.
    pub partial: bool,
}

/// The replica executed a prepare and broadcast a sign request for it.
pub struct SignEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub view: ViewNumber,
    pub block: CryptoHash,
}

/// The replica saw a quorum of sign requests for a block and broadcast a commit request for it.
pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub view: ViewNumber,
    pub block: CryptoHash,
}

/// The replica broadcast a view change request for `view`.
pub struct SendViewChangeEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub highest_height: BlockHeight,
}

pub struct ReceivePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub height: BlockHeight,
    pub view: ViewNumber,
    pub block: CryptoHash,
}

pub struct ReceiveSignEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub height: BlockHeight,
    pub view: ViewNumber,
    pub block: CryptoHash,
}

pub struct ReceiveCommitEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub height: BlockHeight,
    pub view: ViewNumber,
    pub block: CryptoHash,
}

pub struct ReceiveViewChangeEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub view: ViewNumber,
    pub height: BlockHeight,
}

/// The replica entered `view`. `leader` is the sealer expected to propose the next block in it.
pub struct StartViewEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub leader: Option<VerifyingKey>,
}

/// The replica gave up on the leader of `view` after waiting for `timeout`, and now wants to move to
/// `to_view`.
pub struct ViewTimeoutEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub to_view: ViewNumber,
    pub timeout: Duration,
}

/// A block was appended to the chain by the replica.
pub struct FinalizeBlockEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub block: CryptoHash,
    pub tx_count: usize,
    pub signatures: usize,
}

/// The replica asked `leader` for the transactions of a partial prepare that its pool did not have.
pub struct RequestMissedTxsEvent {
    pub timestamp: SystemTime,
    pub leader: VerifyingKey,
    pub block: CryptoHash,
    pub missing: usize,
}
