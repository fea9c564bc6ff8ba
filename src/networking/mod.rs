/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer (P2P) networking, and the routing the replica does on top of it.

pub mod network;

pub mod messages;

pub(crate) mod receiving;

pub mod router;

#[cfg(test)]
pub(crate) mod recording;
