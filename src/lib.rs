//! Weather aggregator library.
//!
//! Bridges the Particle device event stream to Fluentd while keeping a
//! queryable registry of every weather station's latest readings and
//! liveness.
//!
//! ```text
//! StreamClient ──frames──▶ decode ──▶ Registry.update
//!                                 └─▶ Sink.forward
//! sweeper ──every second──▶ Registry.sweep
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod http;
pub mod input;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod status;
pub mod telemetry;
