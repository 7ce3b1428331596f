// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backoff policy for failed sends.
//!
//! Backoff is tracked per buffer id, not per batch: the attempt counter
//! describes how unhealthy a sink currently is. A run of failures grows the
//! delay for whichever batch is next in line, and a single success resets it.
//!
//! The counter lives in a [`RetryTable`] that is created by the embedding
//! process and injected into each [`crate::Buffer`], so tests can use a fresh
//! table and several buffers can share one.

use crate::buffer::BufferId;
use crate::constants::MAX_BACKOFF_SECS;
use fnv::FnvHasher;
use hashbrown::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Attempt counter value for a healthy sink.
pub const INITIAL_ATTEMPTS: u32 = 1;

/// Backoff delay after the given number of consecutive failures:
/// `min(60, attempts²)` seconds.
///
/// An `attempts` of 0 is treated as 1.
#[must_use]
pub fn backoff(attempts: u32) -> Duration {
    let attempts = u64::from(attempts.max(1));
    Duration::from_secs(attempts.saturating_mul(attempts).min(MAX_BACKOFF_SECS))
}

/// Backoff bookkeeping for one buffer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Backoff step used by the next failure; [`INITIAL_ATTEMPTS`] when healthy.
    pub attempts: u32,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            attempts: INITIAL_ATTEMPTS,
        }
    }
}

impl RetryState {
    /// Records a failure and returns the delay to wait before the next send.
    ///
    /// The delay is computed from the counter before it is bumped, so the
    /// first failure after a reset waits 1s, the second 4s, and so on.
    pub fn record_failure(&mut self) -> Duration {
        let delay = backoff(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

type FnvBuildHasher = BuildHasherDefault<FnvHasher>;

/// Shared table of [`RetryState`] keyed by buffer id.
///
/// Cloning is cheap and every clone refers to the same table.
#[derive(Debug, Clone, Default)]
pub struct RetryTable {
    states: Arc<Mutex<HashMap<BufferId, RetryState, FnvBuildHasher>>>,
}

impl RetryTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current backoff step for `id` ([`INITIAL_ATTEMPTS`] if unknown).
    #[must_use]
    pub fn attempts(&self, id: &BufferId) -> u32 {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(id).map_or(INITIAL_ATTEMPTS, |state| state.attempts)
    }

    /// Records a failed send for `id` and returns the backoff delay.
    pub fn record_failure(&self, id: &BufferId) -> Duration {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.entry(id.clone()).or_default().record_failure()
    }

    /// Resets `id` after a successful send.
    pub fn reset(&self, id: &BufferId) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = states.get_mut(id) {
            state.reset();
        }
    }
}
