/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Tracks the current view, the view the replica wants to move to, and the adaptive timeout that decides
//! when a leader is considered to have failed.
//!
//! ## Timeout
//!
//! The timeout of a round is `view_timeout * backoff_factor ^ change_cycle`. It is measured from the
//! later of:
//! 1. The last time the replica made progress (finalized a block, or entered a view), and
//! 2. The last time the replica collected a quorum of sign requests.
//!
//! `change_cycle` grows by one with every consecutive timeout, up to `max_change_cycle`, and goes back to 0
//! when a block is finalized.
//!
//! ## Fast view change
//!
//! A [fast view change](ViewTimer::fast_view_change) forgets both of the times above, so that the next
//! call to [`is_timeout`](ViewTimer::is_timeout) returns `true` and the replica moves on without waiting
//! out a full round.

use std::time::{Duration, Instant};

use crate::types::data_types::ViewNumber;

/// Parameters of the view timer, taken from the replica's [configuration](crate::replica::Configuration).
#[derive(Clone, Copy, Debug)]
pub(crate) struct ViewTimerConfiguration {
    pub(crate) view_timeout: Duration,
    pub(crate) backoff_factor: f64,
    pub(crate) max_change_cycle: u32,
    pub(crate) min_change_cycle: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewState {
    /// Waiting for the leader of the current view to make progress.
    Stable,
    /// The leader of the current view is considered failed, and a view change is in flight.
    ChangingView,
}

pub(crate) struct ViewTimer {
    config: ViewTimerConfiguration,
    view: ViewNumber,
    to_view: ViewNumber,
    leader_failed: bool,
    last_consensus_time: Option<Instant>,
    last_sign_time: Option<Instant>,
    change_cycle: u32,
    fast_view_change: bool,
}

impl ViewTimer {
    pub(crate) fn new(config: ViewTimerConfiguration) -> ViewTimer {
        ViewTimer {
            config,
            view: ViewNumber::init(),
            to_view: ViewNumber::init(),
            leader_failed: false,
            last_consensus_time: Some(Instant::now()),
            last_sign_time: None,
            change_cycle: 0,
            fast_view_change: false,
        }
    }

    pub(crate) fn view(&self) -> ViewNumber {
        self.view
    }

    pub(crate) fn to_view(&self) -> ViewNumber {
        self.to_view
    }

    pub(crate) fn leader_failed(&self) -> bool {
        self.leader_failed
    }

    pub(crate) fn change_cycle(&self) -> u32 {
        self.change_cycle
    }

    pub(crate) fn state(&self) -> ViewState {
        if self.leader_failed || self.to_view > self.view {
            ViewState::ChangingView
        } else {
            ViewState::Stable
        }
    }

    /// Whether the pending timeout was caused by a [fast view change](Self::fast_view_change).
    pub(crate) fn is_fast_view_change(&self) -> bool {
        self.fast_view_change
    }

    pub(crate) fn current_timeout(&self) -> Duration {
        self.config
            .view_timeout
            .mul_f64(self.config.backoff_factor.powi(self.change_cycle as i32))
    }

    pub(crate) fn is_timeout(&self, now: Instant) -> bool {
        match self.last_consensus_time.max(self.last_sign_time) {
            Some(last_progress) => now.saturating_duration_since(last_progress) >= self.current_timeout(),
            None => true,
        }
    }

    /// Time elapsed since the replica last made progress, or `None` right after a fast view change.
    pub(crate) fn since_last_consensus(&self, now: Instant) -> Option<Duration> {
        self.last_consensus_time
            .map(|last| now.saturating_duration_since(last))
    }

    /// Give up on the current leader: move `to_view` one view ahead, grow the backoff, and re-arm the timer.
    /// Returns the new `to_view`.
    pub(crate) fn on_timeout(&mut self, now: Instant) -> ViewNumber {
        if self.change_cycle < self.config.max_change_cycle {
            self.change_cycle += 1;
        }
        self.to_view += 1;
        self.leader_failed = true;
        self.fast_view_change = false;
        self.last_consensus_time = Some(now);
        self.to_view
    }

    /// Make the next call to [`is_timeout`](Self::is_timeout) return `true`.
    pub(crate) fn fast_view_change(&mut self) {
        self.last_consensus_time = None;
        self.last_sign_time = None;
        self.fast_view_change = true;
    }

    pub(crate) fn set_leader_failed(&mut self) {
        self.leader_failed = true;
    }

    pub(crate) fn reset_change_cycle(&mut self) {
        self.change_cycle = 0;
    }

    /// Set the view the replica wants to move to. `to_view` never falls below the current view.
    pub(crate) fn set_to_view(&mut self, to_view: ViewNumber) {
        self.to_view = to_view.max(self.view);
    }

    /// Enter `to_view`. If this skips views, the backoff is reset to `min_change_cycle`, since the rest of
    /// the sealers have evidently already waited out the views in between.
    ///
    /// Returns whether views were skipped.
    pub(crate) fn adopt_to_view(&mut self, now: Instant) -> bool {
        let skipped_views = self.to_view > self.view + 1;
        if skipped_views {
            self.change_cycle = self.config.min_change_cycle.min(self.config.max_change_cycle);
        }
        self.view = self.to_view;
        self.leader_failed = false;
        self.fast_view_change = false;
        self.last_consensus_time = Some(now);
        skipped_views
    }

    /// Re-arm the timer after a block is finalized, abandoning any view change in flight.
    pub(crate) fn on_block_finalized(&mut self, now: Instant) {
        self.to_view = self.view;
        self.leader_failed = false;
        self.fast_view_change = false;
        self.last_consensus_time = Some(now);
        self.change_cycle = 0;
    }

    pub(crate) fn note_sign_quorum(&mut self, now: Instant) {
        self.last_sign_time = Some(now);
    }
}
