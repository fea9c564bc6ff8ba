/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via replica's
//! [config](crate::replica::Configuration).
//!
//! pbft_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed onto
//! a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceivePrepare](crate::events::ReceivePrepareEvent) is printed:
//!
//! ```text
//! ReceivePrepare, 1701329264, Id5u7f6, 12, 0, fNGCJyk
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the public key of the
//!   sealer that sent the prepare.
//! - The fourth and fifth values are the height and view of the prepare.
//! - The sixth value is the first seven characters of the Base64 encoding of the hash of the proposed
//!   block.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const PROPOSE: &str = "Propose";
pub const SIGN: &str = "Sign";
pub const COMMIT: &str = "Commit";
pub const SEND_VIEW_CHANGE: &str = "SendViewChange";

pub const RECEIVE_PREPARE: &str = "ReceivePrepare";
pub const RECEIVE_SIGN: &str = "ReceiveSign";
pub const RECEIVE_COMMIT: &str = "ReceiveCommit";
pub const RECEIVE_VIEW_CHANGE: &str = "ReceiveViewChange";

pub const START_VIEW: &str = "StartView";
pub const VIEW_TIMEOUT: &str = "ViewTimeout";
pub const FINALIZE_BLOCK: &str = "FinalizeBlock";

pub const REQUEST_MISSED_TXS: &str = "RequestMissedTxs";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(propose_event.timestamp),
                propose_event.height,
                propose_event.view,
                first_seven_base64_chars(&propose_event.block.bytes()),
                propose_event.tx_count,
                propose_event.partial
            )
        };
        Box::new(logger)
    }
}

impl Logger for SignEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |sign_event: &SignEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                SIGN,
                secs_since_unix_epoch(sign_event.timestamp),
                sign_event.height,
                sign_event.view,
                first_seven_base64_chars(&sign_event.block.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_event: &CommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(commit_event.timestamp),
                commit_event.height,
                commit_event.view,
                first_seven_base64_chars(&commit_event.block.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for SendViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |send_view_change_event: &SendViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                SEND_VIEW_CHANGE,
                secs_since_unix_epoch(send_view_change_event.timestamp),
                send_view_change_event.view,
                send_view_change_event.highest_height
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceivePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_prepare_event: &ReceivePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PREPARE,
                secs_since_unix_epoch(receive_prepare_event.timestamp),
                first_seven_base64_chars(&receive_prepare_event.origin.to_bytes()),
                receive_prepare_event.height,
                receive_prepare_event.view,
                first_seven_base64_chars(&receive_prepare_event.block.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveSignEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_sign_event: &ReceiveSignEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_SIGN,
                secs_since_unix_epoch(receive_sign_event.timestamp),
                first_seven_base64_chars(&receive_sign_event.origin.to_bytes()),
                receive_sign_event.height,
                receive_sign_event.view,
                first_seven_base64_chars(&receive_sign_event.block.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_commit_event: &ReceiveCommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_COMMIT,
                secs_since_unix_epoch(receive_commit_event.timestamp),
                first_seven_base64_chars(&receive_commit_event.origin.to_bytes()),
                receive_commit_event.height,
                receive_commit_event.view,
                first_seven_base64_chars(&receive_commit_event.block.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_view_change_event: &ReceiveViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_VIEW_CHANGE,
                secs_since_unix_epoch(receive_view_change_event.timestamp),
                first_seven_base64_chars(&receive_view_change_event.origin.to_bytes()),
                receive_view_change_event.view,
                receive_view_change_event.height
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_view_event: &StartViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_VIEW,
                secs_since_unix_epoch(start_view_event.timestamp),
                start_view_event.view,
                start_view_event
                    .leader
                    .map(|leader| first_seven_base64_chars(&leader.to_bytes()))
                    .unwrap_or_else(|| String::from("None"))
            )
        };
        Box::new(logger)
    }
}

impl Logger for ViewTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |view_timeout_event: &ViewTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                VIEW_TIMEOUT,
                secs_since_unix_epoch(view_timeout_event.timestamp),
                view_timeout_event.view,
                view_timeout_event.to_view,
                view_timeout_event.timeout.as_millis()
            )
        };
        Box::new(logger)
    }
}

impl Logger for FinalizeBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |finalize_block_event: &FinalizeBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                FINALIZE_BLOCK,
                secs_since_unix_epoch(finalize_block_event.timestamp),
                finalize_block_event.height,
                first_seven_base64_chars(&finalize_block_event.block.bytes()),
                finalize_block_event.tx_count,
                finalize_block_event.signatures
            )
        };
        Box::new(logger)
    }
}

impl Logger for RequestMissedTxsEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |request_missed_txs_event: &RequestMissedTxsEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                REQUEST_MISSED_TXS,
                secs_since_unix_epoch(request_missed_txs_event.timestamp),
                first_seven_base64_chars(&request_missed_txs_event.leader.to_bytes()),
                first_seven_base64_chars(&request_missed_txs_event.block.bytes()),
                request_missed_txs_event.missing
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
