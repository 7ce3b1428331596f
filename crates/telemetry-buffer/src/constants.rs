// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits and defaults shared by every buffer instance.
//!
//! # Memory Budget
//!
//! The only hard memory bound in the pipeline is [`MAX_QUEUED_BYTES`]: the sum
//! of payload sizes of all batches waiting for delivery (including the one
//! currently being sent). It is a process-wide constant and cannot be tuned
//! per buffer.
//!
//! # Defaults
//!
//! | Setting         | Default | Meaning                                   |
//! |-----------------|---------|-------------------------------------------|
//! | `flush_timeout` | 2s      | Quiet period before a partial batch ships |
//! | `retry_count`   | 0       | Send attempts beyond the first, per batch |
//! | `queue_size`    | 1,000   | Accumulated size that forces a flush      |
//! | `send_delay`    | 1s      | Delay before a fresh batch is sent        |

use std::time::Duration;

/// Maximum total payload bytes queued for delivery by a single buffer.
///
/// # Value: 200MiB (209,715,200 bytes)
///
/// A flush whose payload would push the queue past this limit is rejected
/// and the payload discarded; batches already queued are kept.
pub const MAX_QUEUED_BYTES: usize = 200 * 1_024 * 1_024;

/// Default quiet period after the last entry before a partial batch is flushed.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Default retry budget per batch. Zero means a failed batch is dropped.
pub const DEFAULT_RETRY_COUNT: u32 = 0;

/// Default accumulated size (as reported by the serializer) that triggers an
/// inline flush.
pub const DEFAULT_QUEUE_SIZE: usize = 1_000;

/// Default delay before sending a freshly enqueued batch.
pub const DEFAULT_SEND_DELAY: Duration = Duration::from_secs(1);

/// Upper bound accepted for `send_delay`.
pub(crate) const MAX_SEND_DELAY: Duration = Duration::from_secs(60 * 60);

/// Upper bound accepted for `flush_timeout`.
pub(crate) const MAX_FLUSH_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Ceiling for the retry backoff, in seconds.
///
/// With the quadratic policy the ceiling is reached on the 8th consecutive
/// failure: 1, 4, 9, 16, 25, 36, 49, 60, 60, ...
pub const MAX_BACKOFF_SECS: u64 = 60;

/// Maximum encoded size of a single entry accepted by
/// [`crate::serializer::JsonArraySerializer`].
///
/// # Value: 1MiB (1,048,576 bytes)
pub const MAX_ENTRY_SIZE_BYTES: usize = 1_024 * 1_024;
