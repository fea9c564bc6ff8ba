/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of the core of a PBFT replica for permissioned chains.
//!
//! pbft_rs runs the consensus rounds of a sealer (propose, sign, commit, and view change), and leaves
//! block execution, chain storage, transaction pooling, peer-to-peer transport, and block synchronization
//! to the user, who provides them as implementations of the traits in [pluggables] and
//! [networking::network]. To run a replica, see [replica].

pub mod types;

pub mod pluggables;

pub mod networking;

pub mod backup;

pub mod pbft;

pub mod events;

pub(crate) mod event_bus;

pub mod logging;

pub mod hooks;

pub mod replica;
