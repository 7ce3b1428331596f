// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch delivery to a remote collector.
//!
//! The buffer only knows the [`Sender`] trait: one payload in, success or a
//! transient failure out. Retrying is the buffer's job, so implementations
//! make a single attempt per call.
//!
//! [`HttpSender`] is the stock implementation:
//!
//! ```text
//!   payload ──> zstd (optional) ──> HTTP POST ──> 2xx?  ── yes ──> Ok
//!                                                  │
//!                                                  no ──> SendError
//! ```

use crate::error::{BufferError, SendError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, error};
use zstd::stream::write::Encoder;

#[async_trait]
pub trait Sender: Send + Sync + 'static {
    /// Makes one delivery attempt for `payload`.
    async fn send(&self, payload: Bytes) -> Result<(), SendError>;
}

pub struct HttpSenderConfig {
    /// Collector URL the payload is POSTed to.
    pub url: String,
    /// Optional API key, sent in `api_key_header`.
    pub api_key: Option<String>,
    pub api_key_header: String,
    /// Compress payloads with zstd and set `Content-Encoding: zstd`.
    pub use_compression: bool,
    pub compression_level: i32,
    /// Per-request timeout.
    pub timeout: Duration,
    pub https_proxy: Option<String>,
}

impl Default for HttpSenderConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            api_key_header: "X-API-Key".to_string(),
            use_compression: false,
            compression_level: 3,
            timeout: Duration::from_secs(5),
            https_proxy: None,
        }
    }
}

/// POSTs each payload to a collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
    url: reqwest::Url,
    headers: HeaderMap,
    use_compression: bool,
    compression_level: i32,
}

impl HttpSender {
    pub fn new(config: HttpSenderConfig) -> Result<Self, BufferError> {
        let url = reqwest::Url::parse(&config.url).map_err(|e| {
            BufferError::Validation(format!("Invalid collector URL '{}': {e}", config.url))
        })?;

        let headers = build_headers(&config)?;
        let client = build_client(&config)?;

        Ok(HttpSender {
            client,
            url,
            headers,
            use_compression: config.use_compression,
            compression_level: config.compression_level,
        })
    }

    fn encode(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = Encoder::new(Vec::new(), self.compression_level)?;
        encoder.write_all(data)?;
        encoder.finish()
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, payload: Bytes) -> Result<(), SendError> {
        let body = if self.use_compression {
            Bytes::from(
                self.encode(&payload)
                    .map_err(|e| SendError::Payload(format!("Failed to compress payload: {e}")))?,
            )
        } else {
            payload
        };

        let time = Instant::now();
        let resp = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await;
        let elapsed = time.elapsed();

        match resp {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    debug!(
                        "Delivered payload to {} in {} ms",
                        self.url,
                        elapsed.as_millis()
                    );
                    return Ok(());
                }
                if status == StatusCode::FORBIDDEN {
                    error!(
                        "Request was denied by {}: access denied. Please verify that the API key is valid.",
                        self.url
                    );
                }
                Err(SendError::Status(status.as_u16()))
            }
            Err(e) => {
                debug!(
                    "Failed to reach {} after {} ms: {:?}",
                    self.url,
                    elapsed.as_millis(),
                    e
                );
                Err(SendError::Transport(e.to_string()))
            }
        }
    }
}

fn build_headers(config: &HttpSenderConfig) -> Result<HeaderMap, BufferError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(api_key) = &config.api_key {
        let name = HeaderName::from_bytes(config.api_key_header.as_bytes()).map_err(|e| {
            BufferError::Validation(format!(
                "Invalid API key header name '{}': {e}",
                config.api_key_header
            ))
        })?;
        let mut value = HeaderValue::from_str(api_key)
            .map_err(|e| BufferError::Validation(format!("Invalid API key: {e}")))?;
        value.set_sensitive(true);
        headers.insert(name, value);
    }

    if config.use_compression {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
    }
    Ok(headers)
}

fn build_client(config: &HttpSenderConfig) -> Result<reqwest::Client, BufferError> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if let Some(proxy) = &config.https_proxy {
        let proxy = reqwest::Proxy::https(proxy).map_err(|e| {
            BufferError::Validation(format!("Unable to parse proxy configuration: {e}"))
        })?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| BufferError::Validation(format!("Failed to build HTTP client: {e}")))
}
