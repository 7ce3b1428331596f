// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{
    DEFAULT_FLUSH_TIMEOUT, DEFAULT_QUEUE_SIZE, DEFAULT_RETRY_COUNT, DEFAULT_SEND_DELAY,
    MAX_FLUSH_TIMEOUT, MAX_SEND_DELAY,
};
use crate::error::BufferError;
use std::env;
use std::time::Duration;

pub const ENV_FLUSH_TIMEOUT: &str = "TELEMETRY_BUFFER_FLUSH_TIMEOUT";
pub const ENV_RETRY_COUNT: &str = "TELEMETRY_BUFFER_RETRY_COUNT";
pub const ENV_QUEUE_SIZE: &str = "TELEMETRY_BUFFER_QUEUE_SIZE";
pub const ENV_SEND_DELAY: &str = "TELEMETRY_BUFFER_SEND_DELAY";

/// Per-buffer tuning
#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    /// Quiet period after the last entry before a partial batch is flushed
    pub flush_timeout: Duration,
    /// How many times a failed batch is re-attempted before it is dropped
    pub retry_count: u32,
    /// Accumulated serializer size that forces an inline flush
    pub queue_size: usize,
    /// Delay before sending a freshly enqueued batch
    pub send_delay: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
            queue_size: DEFAULT_QUEUE_SIZE,
            send_delay: DEFAULT_SEND_DELAY,
        }
    }
}

impl BufferConfig {
    #[must_use]
    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = flush_timeout;
        self
    }

    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    #[must_use]
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    #[must_use]
    pub fn with_send_delay(mut self, send_delay: Duration) -> Self {
        self.send_delay = send_delay;
        self
    }

    /// Create configuration from environment variables
    ///
    /// Unset variables fall back to defaults. A variable that is set but
    /// cannot be parsed is an error rather than silently ignored.
    pub fn from_env() -> Result<Self, BufferError> {
        let defaults = Self::default();

        let flush_timeout = env_seconds(ENV_FLUSH_TIMEOUT)?.unwrap_or(defaults.flush_timeout);
        let retry_count = env_number::<u32>(ENV_RETRY_COUNT)?.unwrap_or(defaults.retry_count);
        let queue_size = env_number::<usize>(ENV_QUEUE_SIZE)?.unwrap_or(defaults.queue_size);
        let send_delay = env_seconds(ENV_SEND_DELAY)?.unwrap_or(defaults.send_delay);

        let config = Self {
            flush_timeout,
            retry_count,
            queue_size,
            send_delay,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BufferError> {
        if self.flush_timeout.is_zero() {
            return Err(BufferError::Validation(
                "flush_timeout must be greater than 0".to_string(),
            ));
        }

        if self.flush_timeout > MAX_FLUSH_TIMEOUT {
            return Err(BufferError::Validation(format!(
                "flush_timeout must not exceed {}s, got {:?}",
                MAX_FLUSH_TIMEOUT.as_secs(),
                self.flush_timeout
            )));
        }

        if self.queue_size == 0 {
            return Err(BufferError::Validation(
                "queue_size must be greater than 0".to_string(),
            ));
        }

        if self.send_delay > MAX_SEND_DELAY {
            return Err(BufferError::Validation(format!(
                "send_delay must not exceed {}s, got {:?}",
                MAX_SEND_DELAY.as_secs(),
                self.send_delay
            )));
        }

        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|val| val.trim().to_string())
        .filter(|val| !val.is_empty())
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>, BufferError> {
    match env_value(key) {
        None => Ok(None),
        Some(val) => val.parse::<T>().map(Some).map_err(|_| {
            BufferError::Validation(format!(
                "{key} must be a non-negative integer, got '{val}'"
            ))
        }),
    }
}

fn env_seconds(key: &str) -> Result<Option<Duration>, BufferError> {
    let Some(val) = env_value(key) else {
        return Ok(None);
    };
    parse_seconds(&val)
        .map(Some)
        .ok_or_else(|| BufferError::Validation(format!("{key} must be a number of seconds, got '{val}'")))
}

/// Parses a (possibly fractional) number of seconds. Negative, NaN and
/// out-of-range values are rejected.
pub(crate) fn parse_seconds(val: &str) -> Option<Duration> {
    let secs = val.trim().parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}
