//! Input sources for the aggregator.
//!
//! Current input sources:
//! - `particle`: server-sent event stream from the Particle device cloud

pub mod particle;
