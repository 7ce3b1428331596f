// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background tasks driving a [`crate::Buffer`].
//!
//! Each buffer has at most one flush timer task and at most one send task
//! alive at a time; the `flush_timer_pending` and `send_pending` flags in the
//! buffer state guard the spawns. Both tasks stop when the buffer's
//! cancellation token fires.
//!
//! # Flush timer
//!
//! Sleeps until `last_activity + flush_timeout`. If entries arrived in the
//! meantime it sleeps again for the remaining quiet period, otherwise it
//! flushes and exits.
//!
//! # Send task
//!
//! ```text
//!   sleep(delay) ──> send head batch ──> ok:  remove, reset backoff, delay = send_delay
//!        ^                          └──> err: requeue at tail or drop, delay = backoff
//!        └──────────── queue not empty ─────────┘
//! ```
//!
//! The lock is released while the payload is on the wire, so new entries and
//! flushes proceed during a send.

use crate::buffer::{Shared, TimerAction};
use crate::serializer::Serializer;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::debug;

/// Used when a deadline would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + after`, falling back to a far-future deadline instead of
/// overflowing.
pub(crate) fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

pub(crate) fn arm_flush_timer<S: Serializer>(shared: &Arc<Shared<S>>) {
    let deadline = deadline_after(Instant::now(), shared.config.flush_timeout);
    shared
        .runtime
        .spawn(run_flush_timer(Arc::clone(shared), deadline));
}

pub(crate) fn start_sending<S: Serializer>(shared: &Arc<Shared<S>>, delay: Duration) {
    shared.runtime.spawn(run_send_loop(Arc::clone(shared), delay));
}

async fn run_flush_timer<S: Serializer>(shared: Arc<Shared<S>>, mut deadline: Instant) {
    loop {
        tokio::select! {
            () = shared.cancel_token.cancelled() => {
                debug!("{} | Flush timer cancelled", shared.id);
                return;
            }
            () = sleep_until(deadline) => {}
        }

        match shared.on_flush_timer() {
            TimerAction::Rearm(next) => deadline = next,
            TimerAction::Done => return,
        }
    }
}

async fn run_send_loop<S: Serializer>(shared: Arc<Shared<S>>, mut delay: Duration) {
    loop {
        tokio::select! {
            () = shared.cancel_token.cancelled() => {
                debug!("{} | Send loop cancelled", shared.id);
                return;
            }
            () = sleep(delay) => {}
        }

        let Some(payload) = shared.next_payload() else {
            return;
        };

        let result = shared.sender.send(payload).await;

        match shared.complete_send(result) {
            Some(next) => delay = next,
            None => return,
        }
    }
}
