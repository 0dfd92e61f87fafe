//! Telemetry data as it flows through the aggregator.
//!
//! Upstream frames are decoded into [`NormalizedReading`]s, which are the
//! single unit of work handed to both the device registry and the sink.

mod decoder;
mod reading;

pub use decoder::{DecodeError, Envelope, Ttl, decode, parse_record};
pub use reading::{Metric, Metrics, NormalizedReading};
