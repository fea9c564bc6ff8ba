/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The PBFT consensus protocol run by sealers.
//!
//! ## Sealers and leaders
//!
//! Consensus is run by a fixed, ordered set of `n` [sealers](crate::types::sealer_set::SealerSet), which
//! tolerates `f = (n - 1) / 3` faulty sealers and makes decisions with a quorum of `n - f` of them. The
//! leader of a round is the sealer at position `(view + highest_height) mod n`, so leadership rotates with
//! every block even when views do not change.
//!
//! ## Messages
//!
//! Sealers exchange five kinds of signed [messages]: prepare, partial prepare, sign, commit, and view
//! change requests. Every message carries two signatures: `sig` over the block hash alone, which becomes
//! part of the finalized block's seal, and `sig2` over the whole message, which authenticates it.
//!
//! ## Safety
//!
//! A sealer broadcasts a commit request for a block only after persisting the prepare for that block (see
//! [`backup`](crate::backup)), and never votes for a different block at the same height afterwards. Since any
//! two quorums intersect in at least one honest sealer, no two different blocks can be finalized at the
//! same height.
//!
//! ## Liveness
//!
//! A round that does not finish in time triggers a view change. The timeout backs off exponentially with
//! every consecutive failed view (see [`view_timer`]), so that eventually a round fits in a view once the
//! network stabilizes.

pub mod messages;

pub mod partial_block;

pub(crate) mod request_cache;

pub mod view_timer;

pub mod status;

pub mod implementation;
