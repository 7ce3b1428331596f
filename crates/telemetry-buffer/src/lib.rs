// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Non-blocking buffering and delivery of telemetry entries.
//!
//! Entries recorded on a latency-sensitive path are accumulated by a
//! [`Serializer`], finalized into [`queue::Batch`]es either when a size
//! threshold is crossed or after a quiet period, and delivered one batch at a
//! time by a [`Sender`] running on background tokio tasks.
//!
//! ```text
//!   add_entry ──> Serializer ──(threshold / inactivity)──> flush
//!                                                           │
//!                                                           v
//!                          Sender <── send task <── DeliveryQueue (FIFO, byte capped)
//!                            │                          ^
//!                            └── failure: backoff ──────┘ requeue at tail
//! ```
//!
//! Callers never wait on the network: [`Buffer::add_entry`] and
//! [`Buffer::flush`] are synchronous and only touch in-memory state. Memory is
//! bounded by [`constants::MAX_QUEUED_BYTES`] across all pending batches, and
//! failing batches are dropped once their retry budget is spent.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer;
pub mod config;
pub mod constants;
pub mod error;
pub mod logger;
pub mod queue;
pub mod retry;
mod scheduler;
pub mod sender;
pub mod serializer;

pub use buffer::{Buffer, BufferId, BufferStats};
pub use config::BufferConfig;
pub use error::{BufferError, SendError, SerializerError};
pub use retry::RetryTable;
pub use sender::{HttpSender, HttpSenderConfig, Sender};
pub use serializer::{JsonArraySerializer, Serialized, Serializer};
