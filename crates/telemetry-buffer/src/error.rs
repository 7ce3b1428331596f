// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced synchronously to callers of [`crate::Buffer`].
///
/// Delivery failures and data loss happen on background tasks and are never
/// returned here; they are logged and counted in [`crate::BufferStats`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// Bad constructor arguments, or the serializer refused an entry.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The serializer could not produce a payload. Nothing was enqueued.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Enqueueing the payload would exceed the queued byte budget. The
    /// payload was discarded.
    #[error("Queue byte budget exceeded: {needed} bytes requested with {queued} of {cap} bytes queued")]
    Backpressure {
        needed: usize,
        queued: usize,
        cap: usize,
    },
}

/// A failed delivery attempt reported by a [`crate::Sender`].
///
/// Every variant is treated as transient and subject to the retry budget.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Collector responded with status {0}")]
    Status(u16),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to prepare payload: {0}")]
    Payload(String),
}

/// Failure reported by a [`crate::Serializer`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SerializerError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = BufferError::Validation("queue_size must be greater than 0".to_string());
        assert_eq!(
            error.to_string(),
            "Validation failed: queue_size must be greater than 0"
        );
    }

    #[test]
    fn test_backpressure_display() {
        let error = BufferError::Backpressure {
            needed: 10,
            queued: 95,
            cap: 100,
        };
        assert_eq!(
            error.to_string(),
            "Queue byte budget exceeded: 10 bytes requested with 95 of 100 bytes queued"
        );
    }

    #[test]
    fn test_send_error_display() {
        assert_eq!(
            SendError::Status(503).to_string(),
            "Collector responded with status 503"
        );
        assert!(SendError::Transport("connection refused".into())
            .to_string()
            .contains("connection refused"));
    }
}
