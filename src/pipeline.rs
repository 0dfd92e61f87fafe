//! Ingestion and liveness loops.
//!
//! The ingestion loop takes frames from the upstream subscription, decodes
//! them, and hands every reading to the registry and to the sink. The sweep
//! loop periodically re-evaluates device liveness. The two loops share only
//! the registry.

use crate::input::particle::{RawFrame, Subscription, TransportError};
use crate::output::{ForwardError, ReadingSink};
use crate::registry::{Registry, now_unix};
use crate::telemetry::{NormalizedReading, decode};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How often device liveness is re-evaluated.
    pub sweep_interval: Duration,
    /// Bound on a single forward to the sink.
    pub forward_timeout: Duration,
    /// How long an in-flight forward may keep running after shutdown starts.
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            forward_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Counters for the ingestion loop, logged when the pipeline stops.
#[derive(Debug, Default)]
struct PipelineStats {
    frames: AtomicU64,
    keep_alives: AtomicU64,
    decode_errors: AtomicU64,
    transport_errors: AtomicU64,
    forwarded: AtomicU64,
    forward_errors: AtomicU64,
}

impl PipelineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames ({} keep-alives, {} undecodable), {} forwarded, {} forward errors, {} stream errors",
            self.frames.load(Ordering::Relaxed),
            self.keep_alives.load(Ordering::Relaxed),
            self.decode_errors.load(Ordering::Relaxed),
            self.forwarded.load(Ordering::Relaxed),
            self.forward_errors.load(Ordering::Relaxed),
            self.transport_errors.load(Ordering::Relaxed),
        )
    }
}

pub struct Pipeline {
    registry: Arc<Registry>,
    sink: Arc<dyn ReadingSink>,
    config: PipelineConfig,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(registry: Arc<Registry>, sink: Arc<dyn ReadingSink>, config: PipelineConfig) -> Self {
        Self {
            registry,
            sink,
            config,
            stats: PipelineStats::default(),
        }
    }

    /// Run both loops until `cancel` fires, then close the sink.
    pub async fn run(self, mut subscription: Subscription, cancel: CancellationToken) {
        let sweeper = spawn_sweeper(
            self.registry.clone(),
            self.config.sweep_interval,
            cancel.clone(),
        );

        self.ingest(&mut subscription.frames, &mut subscription.errors, &cancel)
            .await;

        // Stop the sweeper too if ingestion ended because the stream did.
        cancel.cancel();
        drop(subscription);
        if let Err(e) = sweeper.await {
            warn!("[Pipeline] Sweep task failed: {}", e);
        }
        self.sink.close().await;
        info!("[Pipeline] {}", self.stats);
        info!("[Pipeline] Stopped");
    }

    /// Process frames and transport errors until the frame channel closes or
    /// `cancel` fires. Per-item failures are logged and never end the loop.
    pub async fn ingest(
        &self,
        frames: &mut mpsc::Receiver<RawFrame>,
        errors: &mut mpsc::Receiver<TransportError>,
        cancel: &CancellationToken,
    ) {
        let mut errors_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        if !self.handle_frame(&frame, cancel).await {
                            break;
                        }
                    }
                    None => {
                        info!("[Pipeline] Frame stream closed");
                        break;
                    }
                },
                error = errors.recv(), if errors_open => match error {
                    Some(e) => {
                        PipelineStats::bump(&self.stats.transport_errors);
                        warn!("[Pipeline] Stream error: {}", e);
                    }
                    None => errors_open = false,
                },
            }
        }
    }

    /// Returns `false` if shutdown interrupted the frame.
    async fn handle_frame(&self, frame: &RawFrame, cancel: &CancellationToken) -> bool {
        PipelineStats::bump(&self.stats.frames);

        let reading = match decode(&frame.data) {
            Ok(Some(reading)) => reading,
            Ok(None) => {
                PipelineStats::bump(&self.stats.keep_alives);
                return true;
            }
            Err(e) => {
                PipelineStats::bump(&self.stats.decode_errors);
                warn!("[Pipeline] Dropping frame: {}", e);
                return true;
            }
        };

        self.registry.update(&reading);
        self.forward(&reading, cancel).await
    }

    async fn forward(&self, reading: &NormalizedReading, cancel: &CancellationToken) -> bool {
        let send = tokio::time::timeout(self.config.forward_timeout, self.sink.forward(reading));
        tokio::pin!(send);

        let mut completed = true;
        let result = tokio::select! {
            result = &mut send => result,
            _ = cancel.cancelled() => {
                completed = false;
                match tokio::time::timeout(self.config.shutdown_grace, &mut send).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            "[Pipeline] Abandoning in-flight send for {} after {:?}",
                            reading.device_id, self.config.shutdown_grace
                        );
                        return false;
                    }
                }
            }
        };

        match result.unwrap_or(Err(ForwardError::Timeout(self.config.forward_timeout))) {
            Ok(()) => {
                PipelineStats::bump(&self.stats.forwarded);
                debug!("[Pipeline] Data processed ({})", reading.device_id);
            }
            Err(e) => {
                PipelineStats::bump(&self.stats.forward_errors);
                warn!(
                    "[Pipeline] Could not send data from {} to sink: {}",
                    reading.device_id, e
                );
            }
        }
        completed
    }
}

/// Re-evaluate device liveness every `every` until `cancel` fires.
pub fn spawn_sweeper(
    registry: Arc<Registry>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let transitions = registry.sweep(now_unix(), registry.liveness_timeout());
                    if transitions > 0 {
                        debug!("[Pipeline] Sweep marked {} device(s) inactive", transitions);
                    }
                }
            }
        }
        debug!("[Pipeline] Sweep loop stopped");
    })
}
