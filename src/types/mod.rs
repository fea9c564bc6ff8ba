/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types used across the replica: blocks, sealer sets, and the byte-storing newtypes they are made of.

pub mod block;

pub mod crypto_primitives;

pub mod data_types;

pub mod sealer_set;

pub(crate) mod signed_messages;
