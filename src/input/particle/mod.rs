//! Particle device cloud input.
//!
//! Subscribes to the device event stream and hands raw frames to the
//! pipeline, reconnecting with backoff whenever the stream is lost.

mod client;
mod sse;

pub use client::{PARTICLE_API_URL, StreamClient, StreamConfig, Subscription, TransportError};
pub use sse::{MAX_LINE_LEN, RawFrame, SseParser};
