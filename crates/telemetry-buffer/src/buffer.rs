// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-sink buffer: accumulation, flushing and delivery wired together.
//!
//! # Lifecycle of an entry
//!
//! 1. [`Buffer::add_entry`] hands the entry to the serializer.
//! 2. If the serializer's size reaches `queue_size`, the buffer flushes inline.
//!    Otherwise it makes sure an inactivity timer is armed.
//! 3. A flush finalizes the accumulated payload into a [`Batch`] and appends
//!    it to the [`DeliveryQueue`], then starts the send task if it is idle.
//! 4. The send task delivers the head batch after `send_delay` (or after the
//!    backoff delay following a failure), one batch at a time.
//!
//! # Concurrency
//!
//! All state for one buffer sits behind a single mutex. It is held only for
//! in-memory bookkeeping and never across an `.await`; network I/O happens on
//! the send task with the lock released.

use crate::config::BufferConfig;
use crate::constants::MAX_QUEUED_BYTES;
use crate::error::BufferError;
use crate::queue::{Batch, DeliveryQueue};
use crate::retry::RetryTable;
use crate::scheduler;
use crate::sender::Sender;
use crate::serializer::Serializer;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Identifier of a logical sink. Also the key for backoff state, so it must
/// be unique per sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, derive_more::Into)]
pub struct BufferId(String);

impl BufferId {
    pub fn new(id: impl Into<String>) -> Result<Self, BufferError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(BufferError::Validation(
                "buffer id cannot be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Point-in-time view of a buffer, for health checks and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BufferStats {
    pub queued_batches: usize,
    pub queued_bytes: usize,
    pub flush_timer_pending: bool,
    pub send_pending: bool,
    pub flush_timers_armed: u64,
    pub batches_sent: u64,
    pub batches_dropped: u64,
    pub backpressure_rejections: u64,
}

#[derive(Debug, Default)]
struct Counters {
    flush_timers_armed: u64,
    batches_sent: u64,
    batches_dropped: u64,
    backpressure_rejections: u64,
}

pub(crate) struct State<S> {
    serializer: S,
    queue: DeliveryQueue,
    last_activity: Instant,
    flush_timer_pending: bool,
    send_pending: bool,
    counters: Counters,
}

/// What the flush timer should do after waking up.
pub(crate) enum TimerAction {
    /// Entries arrived since arming; sleep until this deadline instead.
    Rearm(Instant),
    Done,
}

pub(crate) struct Shared<S> {
    pub(crate) id: BufferId,
    pub(crate) config: BufferConfig,
    pub(crate) sender: Arc<dyn Sender>,
    pub(crate) retries: RetryTable,
    pub(crate) runtime: Handle,
    pub(crate) cancel_token: CancellationToken,
    state: Mutex<State<S>>,
}

/// Buffers entries for one sink and delivers them in batches.
///
/// Must be created inside a tokio runtime; its timers run as tasks on that
/// runtime. Dropping the buffer stops its timers, and anything still queued
/// is discarded.
pub struct Buffer<S: Serializer> {
    shared: Arc<Shared<S>>,
}

impl<S: Serializer> Buffer<S> {
    pub fn new(
        id: impl Into<String>,
        config: BufferConfig,
        serializer: S,
        sender: Arc<dyn Sender>,
        retries: RetryTable,
    ) -> Result<Self, BufferError> {
        Self::with_max_queued_bytes(id, config, serializer, sender, retries, MAX_QUEUED_BYTES)
    }

    pub(crate) fn with_max_queued_bytes(
        id: impl Into<String>,
        config: BufferConfig,
        serializer: S,
        sender: Arc<dyn Sender>,
        retries: RetryTable,
        max_queued_bytes: usize,
    ) -> Result<Self, BufferError> {
        let id = BufferId::new(id).inspect_err(|e| error!("Rejected buffer: {}", e))?;
        config
            .validate()
            .inspect_err(|e| error!("{} | Rejected buffer config: {}", id, e))?;
        let runtime = Handle::try_current().map_err(|_| {
            let e = BufferError::Validation(format!(
                "buffer '{id}' must be created within a tokio runtime"
            ));
            error!("{} | {}", id, e);
            e
        })?;

        debug!("{} | Buffer created: {:?}", id, config);

        let state = State {
            serializer,
            queue: DeliveryQueue::new(max_queued_bytes),
            last_activity: Instant::now(),
            flush_timer_pending: false,
            send_pending: false,
            counters: Counters::default(),
        };

        Ok(Buffer {
            shared: Arc::new(Shared {
                id,
                config,
                sender,
                retries,
                runtime,
                cancel_token: CancellationToken::new(),
                state: Mutex::new(state),
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> &BufferId {
        &self.shared.id
    }

    #[must_use]
    pub fn config(&self) -> &BufferConfig {
        &self.shared.config
    }

    /// Records one entry. Never blocks on I/O.
    ///
    /// Reaching the `queue_size` threshold flushes synchronously, so the
    /// result of that flush (e.g. backpressure) is returned here.
    pub fn add_entry(&self, entry: S::Entry) -> Result<(), BufferError> {
        let shared = &self.shared;
        let mut state = shared.lock();

        let size = state.serializer.add_entry(entry).map_err(|e| {
            error!("{} | Failed to add entry: {}", shared.id, e);
            BufferError::Validation(e.to_string())
        })?;
        state.last_activity = Instant::now();

        if size >= shared.config.queue_size {
            debug!(
                "{} | Size {} reached threshold {}, flushing",
                shared.id, size, shared.config.queue_size
            );
            return shared.flush_locked(&mut state);
        }

        if !state.flush_timer_pending {
            state.flush_timer_pending = true;
            state.counters.flush_timers_armed += 1;
            scheduler::arm_flush_timer(shared);
        }
        Ok(())
    }

    /// Finalizes whatever has been accumulated into a batch and queues it.
    ///
    /// Succeeds without queueing anything when there is nothing to flush.
    pub fn flush(&self) -> Result<(), BufferError> {
        let mut state = self.shared.lock();
        self.shared.flush_locked(&mut state)
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let state = self.shared.lock();
        BufferStats {
            queued_batches: state.queue.len(),
            queued_bytes: state.queue.total_bytes(),
            flush_timer_pending: state.flush_timer_pending,
            send_pending: state.send_pending,
            flush_timers_armed: state.counters.flush_timers_armed,
            batches_sent: state.counters.batches_sent,
            batches_dropped: state.counters.batches_dropped,
            backpressure_rejections: state.counters.backpressure_rejections,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&State<S>) -> R) -> R {
        let state = self.shared.lock();
        f(&state)
    }
}

impl<S: Serializer> Drop for Buffer<S> {
    fn drop(&mut self) {
        self.shared.cancel_token.cancel();
        let state = self.shared.lock();
        if !state.queue.is_empty() {
            warn!(
                "{} | Buffer dropped with {} undelivered batches ({} bytes)",
                self.shared.id,
                state.queue.len(),
                state.queue.total_bytes()
            );
        }
    }
}

impl<S: Serializer> Shared<S> {
    fn lock(&self) -> MutexGuard<'_, State<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush_locked(self: &Arc<Self>, state: &mut State<S>) -> Result<(), BufferError> {
        let result = state.serializer.serialize();
        state.serializer.reset();

        let serialized = result.map_err(|e| {
            error!("{} | Failed to serialize entries: {}", self.id, e);
            BufferError::Serialization(e.to_string())
        })?;

        if let Err(e) = state.queue.ensure_capacity(serialized.byte_len()) {
            state.counters.backpressure_rejections += 1;
            warn!(
                "{} | Discarding {} entries: {}",
                self.id, serialized.count, e
            );
            return Err(e);
        }

        if serialized.count == 0 {
            debug!("{} | Nothing to flush", self.id);
            return Ok(());
        }

        let batch = Batch::new(serialized.payload, serialized.count);
        let bytes = batch.len();
        state.queue.try_push(batch)?;
        debug!(
            "{} | Queued batch of {} entries ({} bytes), {} batches pending",
            self.id,
            serialized.count,
            bytes,
            state.queue.len()
        );

        if !state.send_pending {
            state.send_pending = true;
            scheduler::start_sending(self, self.config.send_delay);
        }
        Ok(())
    }

    /// Called when the flush timer wakes up.
    pub(crate) fn on_flush_timer(self: &Arc<Self>) -> TimerAction {
        let mut state = self.lock();
        let idle = state.last_activity.elapsed();
        if idle < self.config.flush_timeout {
            return TimerAction::Rearm(scheduler::deadline_after(
                state.last_activity,
                self.config.flush_timeout,
            ));
        }

        state.flush_timer_pending = false;
        debug!("{} | Idle for {:?}, flushing", self.id, idle);
        if let Err(e) = self.flush_locked(&mut state) {
            debug!("{} | Inactivity flush failed: {}", self.id, e);
        }
        TimerAction::Done
    }

    /// Payload of the batch at the head of the queue. Clears the send
    /// pending flag when there is nothing left to send.
    pub(crate) fn next_payload(&self) -> Option<bytes::Bytes> {
        let mut state = self.lock();
        if let Some(batch) = state.queue.front() {
            return Some(batch.payload().clone());
        }
        state.send_pending = false;
        None
    }

    /// Applies the outcome of sending the head batch and returns the delay
    /// before the next send, or `None` once the queue has drained.
    pub(crate) fn complete_send(
        &self,
        result: Result<(), crate::error::SendError>,
    ) -> Option<std::time::Duration> {
        let mut state = self.lock();

        let delay = match result {
            Ok(()) => {
                if let Some(batch) = state.queue.remove_front() {
                    state.counters.batches_sent += 1;
                    debug!(
                        "{} | Sent batch of {} entries ({} bytes) after {} failed attempts",
                        self.id,
                        batch.entries(),
                        batch.len(),
                        batch.retries()
                    );
                }
                self.retries.reset(&self.id);
                self.config.send_delay
            }
            Err(e) => {
                let delay = self.retries.record_failure(&self.id);
                warn!(
                    "{} | Failed to send batch: {}. Next attempt in {}s",
                    self.id,
                    e,
                    delay.as_secs()
                );
                if let Some(batch) = state.queue.requeue_front(self.config.retry_count) {
                    state.counters.batches_dropped += 1;
                    warn!(
                        "{} | Dropping batch of {} entries ({} bytes): retry budget exhausted after {} attempts",
                        self.id,
                        batch.entries(),
                        batch.len(),
                        batch.retries()
                    );
                }
                delay
            }
        };

        if state.queue.is_empty() {
            state.send_pending = false;
            debug!("{} | Delivery queue drained", self.id);
            None
        } else {
            Some(delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SendError, SerializerError};
    use crate::retry::INITIAL_ATTEMPTS;
    use crate::serializer::{JsonArraySerializer, Serialized};
    use async_trait::async_trait;
    use bytes::Bytes;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;
    use tracing_test::traced_test;

    /// Replays scripted outcomes, then succeeds.
    #[derive(Default)]
    struct ScriptedSender {
        outcomes: Mutex<VecDeque<Result<(), SendError>>>,
        sent: Mutex<Vec<(Instant, Bytes)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        latency: Duration,
    }

    impl ScriptedSender {
        fn new(outcomes: Vec<Result<(), SendError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Default::default()
            })
        }

        fn failing() -> Arc<Self> {
            Self::new((0..100).map(|_| Err(SendError::Status(503))).collect())
        }

        fn sent(&self) -> Vec<(Instant, Bytes)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sender for ScriptedSender {
        async fn send(&self, payload: Bytes) -> Result<(), SendError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.latency.is_zero() {
                sleep(self.latency).await;
            }
            self.sent.lock().unwrap().push((Instant::now(), payload));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    /// Serializer whose `serialize` always fails.
    #[derive(Default)]
    struct BrokenSerializer {
        entries: usize,
        reset_called: Arc<AtomicBool>,
    }

    impl Serializer for BrokenSerializer {
        type Entry = Value;

        fn add_entry(&mut self, entry: Value) -> Result<usize, SerializerError> {
            if entry.is_null() {
                return Err(SerializerError("null entries are not allowed".into()));
            }
            self.entries += 1;
            Ok(self.entries)
        }

        fn serialize(&mut self) -> Result<Serialized, SerializerError> {
            Err(SerializerError("accumulator corrupted".into()))
        }

        fn reset(&mut self) {
            self.entries = 0;
            self.reset_called.store(true, Ordering::SeqCst);
        }
    }

    fn buffer_with(
        config: BufferConfig,
        sender: Arc<ScriptedSender>,
        retries: RetryTable,
    ) -> Buffer<JsonArraySerializer> {
        Buffer::new(
            "test-sink",
            config,
            JsonArraySerializer::default(),
            sender,
            retries,
        )
        .expect("valid buffer")
    }

    fn quiet_config() -> BufferConfig {
        // Long send delay keeps flushed batches in the queue for inspection.
        BufferConfig::default()
            .with_queue_size(1000)
            .with_send_delay(Duration::from_secs(600))
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let result = Buffer::new(
            "test-sink",
            BufferConfig::default(),
            JsonArraySerializer::<Value>::default(),
            ScriptedSender::new(vec![]),
            RetryTable::new(),
        );
        assert!(matches!(result, Err(BufferError::Validation(msg)) if msg.contains("tokio runtime")));
    }

    #[tokio::test]
    async fn test_new_validates_arguments() {
        let result = Buffer::new(
            "   ",
            BufferConfig::default(),
            JsonArraySerializer::<Value>::default(),
            ScriptedSender::new(vec![]),
            RetryTable::new(),
        );
        assert!(matches!(result, Err(BufferError::Validation(_))));

        let result = Buffer::new(
            "test-sink",
            BufferConfig::default().with_flush_timeout(Duration::from_secs(u64::MAX / 2)),
            JsonArraySerializer::<Value>::default(),
            ScriptedSender::new(vec![]),
            RetryTable::new(),
        );
        assert!(matches!(result, Err(BufferError::Validation(msg)) if msg.contains("flush_timeout")));

        let result = Buffer::new(
            "test-sink",
            BufferConfig::default().with_queue_size(0),
            JsonArraySerializer::<Value>::default(),
            ScriptedSender::new(vec![]),
            RetryTable::new(),
        );
        assert!(matches!(result, Err(BufferError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_triggers_inline_flush() {
        let buffer = buffer_with(
            quiet_config().with_queue_size(2),
            ScriptedSender::new(vec![]),
            RetryTable::new(),
        );

        buffer.add_entry(json!({"n": 1})).unwrap();
        assert_eq!(buffer.stats().queued_batches, 0);
        buffer.add_entry(json!({"n": 2})).unwrap();

        let stats = buffer.stats();
        assert_eq!(stats.queued_batches, 1);
        assert!(stats.send_pending);
        buffer.with_state(|state| {
            let batch = state.queue.front().unwrap();
            assert_eq!(batch.entries(), 2);
            assert_eq!(batch.payload().as_ref(), br#"[{"n":1},{"n":2}]"#);
            assert_eq!(stats.queued_bytes, batch.len());
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_flush_per_threshold_crossing() {
        let buffer = buffer_with(
            quiet_config().with_queue_size(3),
            ScriptedSender::new(vec![]),
            RetryTable::new(),
        );

        for n in 0..7 {
            buffer.add_entry(json!(n)).unwrap();
        }

        assert_eq!(buffer.stats().queued_batches, 2);
        buffer.with_state(|state| {
            assert_eq!(state.serializer.len(), 1);
        });
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Add,
        Flush,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![4 => Just(Step::Add), 1 => Just(Step::Flush)]
    }

    proptest! {
        #[test]
        fn one_batch_per_threshold_crossing(
            queue_size in 1usize..8,
            steps in proptest::collection::vec(step(), 0..100),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let _guard = runtime.enter();
            let buffer = buffer_with(
                quiet_config().with_queue_size(queue_size),
                ScriptedSender::new(vec![]),
                RetryTable::new(),
            );

            let mut pending = 0usize;
            let mut batches = 0usize;
            for (n, step) in steps.into_iter().enumerate() {
                match step {
                    Step::Add => {
                        buffer.add_entry(json!(n)).unwrap();
                        pending += 1;
                        if pending == queue_size {
                            batches += 1;
                            pending = 0;
                        }
                    }
                    Step::Flush => {
                        buffer.flush().unwrap();
                        if pending > 0 {
                            batches += 1;
                            pending = 0;
                        }
                    }
                }
                prop_assert_eq!(buffer.stats().queued_batches, batches);
                prop_assert_eq!(buffer.with_state(|state| state.serializer.len()), pending);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_timer_is_armed_once() {
        let buffer = buffer_with(quiet_config(), ScriptedSender::new(vec![]), RetryTable::new());

        for n in 0..50 {
            buffer.add_entry(json!(n)).unwrap();
        }

        let stats = buffer.stats();
        assert!(stats.flush_timer_pending);
        assert_eq!(stats.flush_timers_armed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_flush_waits_for_quiet_period() {
        let buffer = buffer_with(
            quiet_config().with_flush_timeout(Duration::from_secs(2)),
            ScriptedSender::new(vec![]),
            RetryTable::new(),
        );

        buffer.add_entry(json!("first")).unwrap();
        sleep(Duration::from_secs(1)).await;
        buffer.add_entry(json!("second")).unwrap();

        // The timer fires at t=2s but the last entry was at t=1s: re-arm.
        sleep(Duration::from_millis(1500)).await;
        let stats = buffer.stats();
        assert_eq!(stats.queued_batches, 0);
        assert!(stats.flush_timer_pending);

        // Quiet since t=1s, so the flush happens at t=3s.
        sleep(Duration::from_millis(600)).await;
        let stats = buffer.stats();
        assert_eq!(stats.queued_batches, 1);
        assert!(!stats.flush_timer_pending);
        assert_eq!(stats.flush_timers_armed, 1);
        buffer.with_state(|state| {
            assert_eq!(state.queue.front().unwrap().entries(), 2);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_rearms_after_firing() {
        let buffer = buffer_with(
            quiet_config().with_flush_timeout(Duration::from_secs(1)),
            ScriptedSender::new(vec![]),
            RetryTable::new(),
        );

        buffer.add_entry(json!(1)).unwrap();
        sleep(Duration::from_millis(1100)).await;
        buffer.add_entry(json!(2)).unwrap();
        sleep(Duration::from_millis(1100)).await;

        let stats = buffer.stats();
        assert_eq!(stats.queued_batches, 2);
        assert_eq!(stats.flush_timers_armed, 2);
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let buffer = buffer_with(quiet_config(), ScriptedSender::new(vec![]), RetryTable::new());

        assert_eq!(buffer.flush(), Ok(()));
        let stats = buffer.stats();
        assert_eq!(stats.queued_batches, 0);
        assert_eq!(stats.queued_bytes, 0);
        assert!(!stats.send_pending);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_serialize_failure_resets_and_reports() {
        let serializer = BrokenSerializer::default();
        let reset_called = Arc::clone(&serializer.reset_called);
        let buffer = Buffer::new(
            "broken",
            quiet_config(),
            serializer,
            ScriptedSender::new(vec![]),
            RetryTable::new(),
        )
        .unwrap();

        buffer.add_entry(json!("x")).unwrap();
        let err = buffer.flush().unwrap_err();

        assert!(matches!(err, BufferError::Serialization(msg) if msg.contains("corrupted")));
        assert!(reset_called.load(Ordering::SeqCst));
        assert_eq!(buffer.stats().queued_batches, 0);
        assert!(logs_contain("Failed to serialize entries"));
    }

    #[tokio::test]
    async fn test_rejected_entry_has_no_side_effects() {
        let buffer = Buffer::new(
            "strict",
            quiet_config(),
            BrokenSerializer::default(),
            ScriptedSender::new(vec![]),
            RetryTable::new(),
        )
        .unwrap();

        let err = buffer.add_entry(Value::Null).unwrap_err();
        assert_eq!(
            err,
            BufferError::Validation("null entries are not allowed".to_string())
        );
        let stats = buffer.stats();
        assert!(!stats.flush_timer_pending);
        assert_eq!(stats.flush_timers_armed, 0);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_backpressure_keeps_existing_batches() {
        let buffer = Buffer::with_max_queued_bytes(
            "capped",
            quiet_config(),
            JsonArraySerializer::<Value>::default(),
            ScriptedSender::new(vec![]),
            RetryTable::new(),
            32,
        )
        .unwrap();

        buffer.add_entry(json!("0123456789")).unwrap();
        buffer.flush().unwrap();
        let before = buffer.stats();
        assert_eq!(before.queued_batches, 1);
        assert_eq!(before.queued_bytes, 14);

        buffer.add_entry(json!("abcdefghijklmnopqrstuvwxyz")).unwrap();
        let err = buffer.flush().unwrap_err();
        assert!(matches!(err, BufferError::Backpressure { cap: 32, queued: 14, .. }));

        let after = buffer.stats();
        assert_eq!(after.queued_batches, 1);
        assert_eq!(after.queued_bytes, 14);
        assert_eq!(after.backpressure_rejections, 1);
        assert!(logs_contain("Discarding 1 entries"));

        // The rejected entries are gone, not carried into the next flush.
        assert_eq!(buffer.flush(), Ok(()));
        assert_eq!(buffer.stats().queued_batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_releases_bytes_and_resets_backoff() {
        let retries = RetryTable::new();
        let sender = ScriptedSender::new(vec![]);
        let buffer = buffer_with(
            BufferConfig::default().with_queue_size(1),
            Arc::clone(&sender),
            retries.clone(),
        );
        retries.record_failure(buffer.id());
        retries.record_failure(buffer.id());

        buffer.add_entry(json!("hello")).unwrap();
        assert_eq!(buffer.stats().queued_bytes, 9);

        sleep(Duration::from_millis(1100)).await;

        let stats = buffer.stats();
        assert_eq!(stats.queued_bytes, 0);
        assert_eq!(stats.queued_batches, 0);
        assert_eq!(stats.batches_sent, 1);
        assert!(!stats.send_pending);
        assert_eq!(retries.attempts(buffer.id()), INITIAL_ATTEMPTS);
        assert_eq!(sender.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_exhausted_batch_is_dropped() {
        let sender = ScriptedSender::failing();
        let buffer = buffer_with(
            BufferConfig::default()
                .with_queue_size(1)
                .with_retry_count(2),
            Arc::clone(&sender),
            RetryTable::new(),
        );
        let start = Instant::now();

        buffer.add_entry(json!("doomed")).unwrap();

        // First attempt at t=1s fails: requeued with one retry used.
        sleep(Duration::from_millis(1100)).await;
        buffer.with_state(|state| {
            assert_eq!(state.queue.front().unwrap().retries(), 1);
        });
        assert!(buffer.stats().send_pending);

        // Second attempt after a 1s backoff fails and spends the budget.
        sleep(Duration::from_secs(1)).await;
        let stats = buffer.stats();
        assert_eq!(stats.queued_batches, 0);
        assert_eq!(stats.queued_bytes, 0);
        assert_eq!(stats.batches_dropped, 1);
        assert!(!stats.send_pending);

        let sent = sender.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0 - start, Duration::from_secs(1));
        assert_eq!(sent[1].0 - start, Duration::from_secs(2));
        assert!(logs_contain("retry budget exhausted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retries_drops_on_first_failure() {
        let sender = ScriptedSender::failing();
        let buffer = buffer_with(
            BufferConfig::default().with_queue_size(1),
            Arc::clone(&sender),
            RetryTable::new(),
        );

        buffer.add_entry(json!("once")).unwrap();
        sleep(Duration::from_secs(5)).await;

        assert_eq!(sender.sent().len(), 1);
        assert_eq!(buffer.stats().batches_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_goes_behind_newer_batches() {
        let sender = ScriptedSender::new(vec![Err(SendError::Status(500))]);
        let buffer = buffer_with(
            BufferConfig::default()
                .with_queue_size(1)
                .with_retry_count(3),
            Arc::clone(&sender),
            RetryTable::new(),
        );

        buffer.add_entry(json!("a")).unwrap();
        buffer.add_entry(json!("b")).unwrap();
        sleep(Duration::from_secs(10)).await;

        let order: Vec<Bytes> = sender.sent().into_iter().map(|(_, p)| p).collect();
        assert_eq!(
            order,
            vec![
                Bytes::from_static(br#"["a"]"#),
                Bytes::from_static(br#"["b"]"#),
                Bytes::from_static(br#"["a"]"#),
            ]
        );
        let stats = buffer.stats();
        assert_eq!(stats.batches_sent, 2);
        assert_eq!(stats.queued_batches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_are_sequential() {
        let sender = Arc::new(ScriptedSender {
            latency: Duration::from_millis(500),
            ..Default::default()
        });
        let buffer = buffer_with(
            BufferConfig::default()
                .with_queue_size(1)
                .with_send_delay(Duration::ZERO),
            Arc::clone(&sender),
            RetryTable::new(),
        );

        for n in 0..5 {
            buffer.add_entry(json!(n)).unwrap();
            sleep(Duration::from_millis(100)).await;
        }
        sleep(Duration::from_secs(5)).await;

        assert_eq!(sender.sent().len(), 5);
        assert_eq!(sender.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.stats().batches_sent, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bytes_counted_while_in_flight() {
        let sender = Arc::new(ScriptedSender {
            latency: Duration::from_secs(3),
            ..Default::default()
        });
        let buffer = buffer_with(
            BufferConfig::default()
                .with_queue_size(1)
                .with_send_delay(Duration::ZERO),
            Arc::clone(&sender),
            RetryTable::new(),
        );

        buffer.add_entry(json!("in flight")).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(sender.in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.stats().queued_bytes, 13);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(buffer.stats().queued_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_timers() {
        let sender = ScriptedSender::new(vec![]);
        let buffer = buffer_with(
            BufferConfig::default().with_queue_size(1),
            Arc::clone(&sender),
            RetryTable::new(),
        );

        buffer.add_entry(json!("never sent")).unwrap();
        drop(buffer);
        sleep(Duration::from_secs(5)).await;

        assert!(sender.sent().is_empty());
    }

    #[test]
    fn test_buffer_id() {
        let id = BufferId::new("  http-logs ").unwrap();
        assert_eq!(id.as_str(), "http-logs");
        assert_eq!(id.to_string(), "http-logs");
        let raw: String = id.into();
        assert_eq!(raw, "http-logs");
        assert!(BufferId::new("").is_err());
    }

    #[tokio::test]
    async fn test_stats_serialize() {
        let buffer = buffer_with(quiet_config(), ScriptedSender::new(vec![]), RetryTable::new());
        buffer.add_entry(json!(1)).unwrap();

        let stats = serde_json::to_value(buffer.stats()).unwrap();
        assert_eq!(stats["flush_timer_pending"], json!(true));
        assert_eq!(stats["queued_batches"], json!(0));
    }
}
