//! Output sinks for decoded readings.
//!
//! Forwarding is fire-and-forget: a reading that cannot be delivered is
//! logged by the caller and dropped. Nothing is buffered, queued or
//! retried, so a sink outage loses the readings that arrive during it.
//! A durable sink can replace [`FluentSink`] by implementing
//! [`ReadingSink`] without touching the ingestion loop.

mod fluent;

pub use fluent::{FluentConfig, FluentSink, encode_message};

use crate::telemetry::NormalizedReading;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("could not reconnect to sink: {0}")]
    Reconnect(#[source] std::io::Error),

    #[error("failed to send record: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

/// Destination for decoded readings.
#[async_trait]
pub trait ReadingSink: Send + Sync {
    /// Deliver one reading. Errors mean the reading is lost.
    async fn forward(&self, reading: &NormalizedReading) -> Result<(), ForwardError>;

    /// Release the underlying connection.
    async fn close(&self) {}
}
