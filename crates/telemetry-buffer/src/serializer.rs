// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry accumulation and payload encoding.
//!
//! A [`Serializer`] is the accumulator owned by each buffer. The buffer never
//! looks inside the payload it produces; it only compares the size returned by
//! [`Serializer::add_entry`] against its `queue_size` threshold and forwards
//! the finished payload to the delivery queue.
//!
//! # Output Format
//!
//! [`JsonArraySerializer`] formats a batch as a JSON array:
//! ```json
//! [{"message":"entry 1"},{"message":"entry 2"}]
//! ```

use crate::constants::MAX_ENTRY_SIZE_BYTES;
use crate::error::SerializerError;
use bytes::Bytes;
use serde::Serialize;
use std::marker::PhantomData;
use tracing::warn;

/// A finished payload handed over by [`Serializer::serialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Serialized {
    pub payload: Bytes,
    /// Number of entries in `payload`. Zero means there was nothing to send.
    pub count: usize,
}

impl Serialized {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            payload: Bytes::new(),
            count: 0,
        }
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.payload.len()
    }
}

/// Accumulates entries into an in-progress payload.
///
/// Implementations decide what "size" means (entry count or byte count) and
/// must report it consistently, since it is compared directly with the
/// buffer's `queue_size`.
pub trait Serializer: Send + 'static {
    type Entry;

    /// Adds one entry and returns the accumulated size.
    fn add_entry(&mut self, entry: Self::Entry) -> Result<usize, SerializerError>;

    /// Produces the payload for everything accumulated so far.
    fn serialize(&mut self) -> Result<Serialized, SerializerError>;

    /// Discards accumulated state. Called after every `serialize`, whether or
    /// not it succeeded.
    fn reset(&mut self);
}

/// Encodes entries as a JSON array. Size is the entry count.
#[derive(Debug)]
pub struct JsonArraySerializer<T = serde_json::Value> {
    /// `[` followed by comma separated entries; the closing `]` is added by
    /// `serialize`. Reused across batches.
    buffer: Vec<u8>,
    count: usize,
    max_entry_bytes: usize,
    _entry: PhantomData<fn(T)>,
}

impl<T> Default for JsonArraySerializer<T> {
    fn default() -> Self {
        Self::new(MAX_ENTRY_SIZE_BYTES)
    }
}

impl<T> JsonArraySerializer<T> {
    #[must_use]
    pub fn new(max_entry_bytes: usize) -> Self {
        JsonArraySerializer {
            buffer: Vec::new(),
            count: 0,
            max_entry_bytes,
            _entry: PhantomData,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<T: Serialize + 'static> Serializer for JsonArraySerializer<T> {
    type Entry = T;

    fn add_entry(&mut self, entry: T) -> Result<usize, SerializerError> {
        let encoded = serde_json::to_vec(&entry)
            .map_err(|e| SerializerError(format!("Failed to encode entry: {e}")))?;

        if encoded.len() > self.max_entry_bytes {
            warn!(
                "Dropping entry of {} bytes, larger than the {} byte limit",
                encoded.len(),
                self.max_entry_bytes
            );
            return Err(SerializerError(format!(
                "Entry of {} bytes exceeds the {} byte limit",
                encoded.len(),
                self.max_entry_bytes
            )));
        }

        if self.count == 0 {
            self.buffer.push(b'[');
        } else {
            self.buffer.push(b',');
        }
        self.buffer.extend_from_slice(&encoded);
        self.count += 1;
        Ok(self.count)
    }

    fn serialize(&mut self) -> Result<Serialized, SerializerError> {
        if self.count == 0 {
            return Ok(Serialized::empty());
        }

        let mut payload = Vec::with_capacity(self.buffer.len() + 1);
        payload.extend_from_slice(&self.buffer);
        payload.push(b']');
        Ok(Serialized {
            payload: Bytes::from(payload),
            count: self.count,
        })
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.count = 0;
    }
}
