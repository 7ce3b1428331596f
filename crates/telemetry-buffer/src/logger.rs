// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for processes that embed the buffer.
//!
//! The crate itself only emits `tracing` events; installing a subscriber is
//! up to the host. [`init`] is a convenience for hosts without one.
//!
//! # Format
//!
//! ```text
//! TELEMETRY_BUFFER | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! For example:
//!
//! ```text
//! TELEMETRY_BUFFER | WARN | http-logs | Failed to send batch: Collector responded with status 503. Next attempt in 4s
//! ```

use crate::error::BufferError;
use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Prefixes every line with `TELEMETRY_BUFFER` so buffer logs can be told
/// apart from the host application's.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "TELEMETRY_BUFFER | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                // Populated by the fmt layer on span creation.
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Builds the filter used by [`init`]. Chatty transport crates are silenced.
pub fn env_filter(log_level: &str) -> Result<EnvFilter, BufferError> {
    let directives = format!("h2=off,hyper=off,rustls=off,{log_level}");
    EnvFilter::try_new(directives)
        .map_err(|e| BufferError::Validation(format!("Invalid log level '{log_level}': {e}")))
}

/// Installs a global subscriber using [`Formatter`].
///
/// Fails if `log_level` is not a valid filter or a global subscriber is
/// already set.
pub fn init(log_level: &str) -> Result<(), BufferError> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(log_level)?)
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| BufferError::Validation(format!("Failed to set global subscriber: {e}")))
}
