/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged by replicas in the PBFT protocol.
//!
//! Every protocol message is built around a [`PBFTMsg`], which carries two signatures by the message's
//! origin:
//! 1. `sig`, over the `block_hash` the message is about, and
//! 2. `sig2`, over every other field of the message.
//!
//! `sig` on a [`SignReq`] is what gets attached to a finalized block as evidence of the quorum.

use std::{
    ops::Deref,
    time::{SystemTime, UNIX_EPOCH},
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    block::{Block, BlockHeader},
    crypto_primitives::{self, hash, Keypair, VerifyingKey},
    data_types::{BlockHeight, CryptoHash, NodeIndex, SignatureBytes, ViewNumber},
    signed_messages::SignedMessage,
};

/// Fields shared by all PBFT messages.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PBFTMsg {
    pub height: BlockHeight,
    pub view: ViewNumber,
    pub idx: NodeIndex,
    /// Milliseconds since the Unix Epoch when the message was created.
    pub timestamp: u64,
    pub block_hash: CryptoHash,
    pub sig: SignatureBytes,
    pub sig2: SignatureBytes,
}

impl PBFTMsg {
    pub(crate) fn new(
        keypair: &Keypair,
        height: BlockHeight,
        view: ViewNumber,
        idx: NodeIndex,
        block_hash: CryptoHash,
    ) -> PBFTMsg {
        let timestamp = millis_since_unix_epoch();
        let sig = keypair.sign(&block_hash.bytes());
        let sig2 = keypair.sign(&Self::fields_bytes(height, view, idx, timestamp, &block_hash));
        PBFTMsg {
            height,
            view,
            idx,
            timestamp,
            block_hash,
            sig,
            sig2,
        }
    }

    fn fields_bytes(
        height: BlockHeight,
        view: ViewNumber,
        idx: NodeIndex,
        timestamp: u64,
        block_hash: &CryptoHash,
    ) -> Vec<u8> {
        // Safety: serializing plain integers and arrays into memory cannot fail.
        (height, view, idx, timestamp, *block_hash).try_to_vec().unwrap()
    }

    /// Key that identifies this exact message in broadcast filters.
    pub fn unique_key(&self) -> CryptoHash {
        let mut bytes = Vec::with_capacity(128);
        bytes.extend_from_slice(&self.sig.bytes());
        bytes.extend_from_slice(&self.sig2.bytes());
        hash(&bytes)
    }

    /// Check both of the message's signatures against `verifying_key`.
    pub(crate) fn is_correctly_signed(&self, verifying_key: &VerifyingKey) -> bool {
        crypto_primitives::verify(verifying_key, &self.block_hash.bytes(), &self.sig)
            && self.is_correct(verifying_key)
    }
}

impl SignedMessage for PBFTMsg {
    fn message_bytes(&self) -> Vec<u8> {
        Self::fields_bytes(self.height, self.view, self.idx, self.timestamp, &self.block_hash)
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.sig2
    }
}

/// A proposal of a block by the leader of a view.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrepareReq {
    pub msg: PBFTMsg,
    pub block: Block,
}

impl PrepareReq {
    /// Propose `block` as sealer `idx` in `view`.
    pub(crate) fn new(keypair: &Keypair, view: ViewNumber, idx: NodeIndex, block: Block) -> PrepareReq {
        let msg = PBFTMsg::new(keypair, block.height(), view, idx, block.hash());
        PrepareReq { msg, block }
    }

    /// Re-sign the same block as sealer `idx` in `view`. Used to re-propose a committed prepare.
    pub(crate) fn resign(&self, keypair: &Keypair, view: ViewNumber, idx: NodeIndex) -> PrepareReq {
        PrepareReq::new(keypair, view, idx, self.block.clone())
    }

    /// The locally executed version of this prepare: `executed_block` replaces the proposed block, and
    /// the message is re-signed by this replica while keeping the proposal's `view` and `idx`.
    pub(crate) fn executed(&self, keypair: &Keypair, executed_block: Block) -> PrepareReq {
        let msg = PBFTMsg::new(
            keypair,
            executed_block.height(),
            self.msg.view,
            self.msg.idx,
            executed_block.hash(),
        );
        PrepareReq {
            msg,
            block: executed_block,
        }
    }
}

impl Deref for PrepareReq {
    type Target = PBFTMsg;
    fn deref(&self) -> &PBFTMsg {
        &self.msg
    }
}

/// A sealer's endorsement of the executed block of a prepare.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignReq(pub PBFTMsg);

impl SignReq {
    pub(crate) fn new(keypair: &Keypair, prepare: &PrepareReq, idx: NodeIndex) -> SignReq {
        SignReq(PBFTMsg::new(keypair, prepare.height, prepare.view, idx, prepare.block_hash))
    }
}

impl Deref for SignReq {
    type Target = PBFTMsg;
    fn deref(&self) -> &PBFTMsg {
        &self.0
    }
}

/// A sealer's confirmation that it has seen a quorum of [`SignReq`]s for a block.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CommitReq(pub PBFTMsg);

impl CommitReq {
    pub(crate) fn new(keypair: &Keypair, prepare: &PrepareReq, idx: NodeIndex) -> CommitReq {
        CommitReq(PBFTMsg::new(keypair, prepare.height, prepare.view, idx, prepare.block_hash))
    }
}

impl Deref for CommitReq {
    type Target = PBFTMsg;
    fn deref(&self) -> &PBFTMsg {
        &self.0
    }
}

/// A sealer's request to move to `view`, referencing the highest block it has finalized.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ViewChangeReq(pub PBFTMsg);

impl ViewChangeReq {
    pub(crate) fn new(
        keypair: &Keypair,
        highest: &BlockHeader,
        view: ViewNumber,
        idx: NodeIndex,
    ) -> ViewChangeReq {
        ViewChangeReq(PBFTMsg::new(keypair, highest.height, view, idx, highest.hash()))
    }
}

impl Deref for ViewChangeReq {
    type Target = PBFTMsg;
    fn deref(&self) -> &PBFTMsg {
        &self.0
    }
}

/// A prepare that carries its block's transactions by hash only.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PartialPrepareReq {
    pub msg: PBFTMsg,
    pub header: BlockHeader,
    pub tx_hashes: Vec<CryptoHash>,
}

impl PartialPrepareReq {
    pub(crate) fn from_prepare(prepare: &PrepareReq) -> PartialPrepareReq {
        PartialPrepareReq {
            msg: prepare.msg.clone(),
            header: prepare.block.header.clone(),
            tx_hashes: prepare.block.tx_hashes(),
        }
    }

    /// Check that the header's hash is the hash the message was signed over, and that it commits to
    /// `tx_hashes`.
    pub(crate) fn is_consistent(&self) -> bool {
        self.header.hash() == self.msg.block_hash
            && self.header.height == self.msg.height
            && self.header.transactions_root == Block::transactions_root(&self.tx_hashes)
    }
}

impl Deref for PartialPrepareReq {
    type Target = PBFTMsg;
    fn deref(&self) -> &PBFTMsg {
        &self.msg
    }
}

pub(crate) fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    use super::*;
    use crate::types::block::Transaction;

    fn keypair() -> Keypair {
        let mut csprg = OsRng {};
        Keypair::new(SigningKey::generate(&mut csprg))
    }

    fn block() -> Block {
        Block::new(
            BlockHeight::new(1),
            Block::genesis().hash(),
            NodeIndex::new(0),
            1,
            vec![Transaction::new(vec![9])],
        )
    }

    #[test]
    fn signatures_cover_every_field_test() {
        let keypair = keypair();
        let prepare = PrepareReq::new(&keypair, ViewNumber::new(0), NodeIndex::new(0), block());
        assert!(prepare.is_correctly_signed(&keypair.public()));
        assert!(!prepare.is_correctly_signed(&self::keypair().public()));

        let mut tampered = prepare.msg.clone();
        tampered.view = ViewNumber::new(1);
        assert!(!tampered.is_correctly_signed(&keypair.public()));

        let mut tampered = prepare.msg.clone();
        tampered.block_hash = CryptoHash::zero();
        assert!(!tampered.is_correctly_signed(&keypair.public()));
    }

    #[test]
    fn unique_key_distinguishes_messages_test() {
        let keypair = keypair();
        let prepare = PrepareReq::new(&keypair, ViewNumber::new(0), NodeIndex::new(0), block());
        let sign = SignReq::new(&keypair, &prepare, NodeIndex::new(0));
        let commit = CommitReq::new(&keypair, &prepare, NodeIndex::new(0));
        assert_ne!(sign.unique_key(), commit.unique_key());
        assert_eq!(sign.unique_key(), sign.clone().unique_key());
    }

    #[test]
    fn partial_prepare_consistency_test() {
        let keypair = keypair();
        let prepare = PrepareReq::new(&keypair, ViewNumber::new(0), NodeIndex::new(0), block());
        let partial = PartialPrepareReq::from_prepare(&prepare);
        assert!(partial.is_consistent());
        assert_eq!(partial.tx_hashes, prepare.block.tx_hashes());

        let mut missing_hash = partial.clone();
        missing_hash.tx_hashes.clear();
        assert!(!missing_hash.is_consistent());
    }

    #[test]
    fn executed_prepare_keeps_proposal_view_and_index_test() {
        let leader = keypair();
        let follower = keypair();
        let prepare = PrepareReq::new(&leader, ViewNumber::new(3), NodeIndex::new(1), block());

        let mut executed_block = prepare.block.clone();
        executed_block.header.state_root = CryptoHash::new([5u8; 32]);
        let executed = prepare.executed(&follower, executed_block.clone());

        assert_eq!(executed.view, ViewNumber::new(3));
        assert_eq!(executed.idx, NodeIndex::new(1));
        assert_eq!(executed.block_hash, executed_block.hash());
        assert_ne!(executed.block_hash, prepare.block_hash);
    }
}
