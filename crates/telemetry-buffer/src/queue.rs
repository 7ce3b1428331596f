// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-bounded FIFO of batches awaiting delivery.
//!
//! # Ordering
//!
//! Batches are appended at the tail and sent from the head, so the oldest
//! batch goes first. A batch that fails is moved to the tail rather than
//! retried in place, which lets newer batches through while one payload keeps
//! failing.
//!
//! # Byte Accounting
//!
//! `total_bytes` is always the sum of the payload lengths of the batches in
//! the queue. The batch being sent stays at the head until its outcome is
//! known, so it is still counted while in flight.

use crate::constants::MAX_QUEUED_BYTES;
use crate::error::BufferError;
use bytes::Bytes;
use std::collections::VecDeque;

/// One finalized payload awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    payload: Bytes,
    entries: usize,
    retries: u32,
}

impl Batch {
    #[must_use]
    pub fn new(payload: impl Into<Bytes>, entries: usize) -> Self {
        Self {
            payload: payload.into(),
            entries,
            retries: 0,
        }
    }

    /// Payload bytes. Cloning is reference counted.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Number of entries serialized into the payload.
    #[must_use]
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Failed send attempts so far.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

#[derive(Debug)]
pub struct DeliveryQueue {
    batches: VecDeque<Batch>,
    total_bytes: usize,
    max_bytes: usize,
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new(MAX_QUEUED_BYTES)
    }
}

impl DeliveryQueue {
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            batches: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Checks whether `needed` more bytes fit in the byte budget.
    pub fn ensure_capacity(&self, needed: usize) -> Result<(), BufferError> {
        let fits = self
            .total_bytes
            .checked_add(needed)
            .is_some_and(|total| total <= self.max_bytes);
        if fits {
            Ok(())
        } else {
            Err(BufferError::Backpressure {
                needed,
                queued: self.total_bytes,
                cap: self.max_bytes,
            })
        }
    }

    /// Appends `batch` at the tail if it fits in the byte budget.
    ///
    /// On rejection the queue is left untouched and the batch is dropped.
    pub fn try_push(&mut self, batch: Batch) -> Result<(), BufferError> {
        self.ensure_capacity(batch.len())?;
        self.total_bytes += batch.len();
        self.batches.push_back(batch);
        Ok(())
    }

    /// The batch that will be sent next.
    #[must_use]
    pub fn front(&self) -> Option<&Batch> {
        self.batches.front()
    }

    /// Removes the head batch for good (delivered or out of retries).
    pub fn remove_front(&mut self) -> Option<Batch> {
        let batch = self.batches.pop_front()?;
        self.total_bytes -= batch.len();
        Some(batch)
    }

    /// Counts a failed attempt against the head batch and moves it to the
    /// tail if it still has budget under `retry_count`.
    ///
    /// Returns the batch when it is out of retries and was removed instead.
    pub fn requeue_front(&mut self, retry_count: u32) -> Option<Batch> {
        let mut batch = self.batches.pop_front()?;
        batch.retries = batch.retries.saturating_add(1);
        if batch.retries < retry_count {
            self.batches.push_back(batch);
            None
        } else {
            self.total_bytes -= batch.len();
            Some(batch)
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}
