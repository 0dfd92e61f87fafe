//! Server-sent event subscription to the Particle device cloud.

use super::sse::{RawFrame, SseParser};
use crate::backoff::{BackoffPolicy, RetryError, retry_with_backoff};
use crate::status::ConnectionState;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const PARTICLE_API_URL: &str = "https://api.particle.io/v1/devices/events/weatherdata";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("access token rejected ({0})")]
    Unauthorized(StatusCode),

    #[error("unexpected response status {0}")]
    Status(StatusCode),

    #[error("event stream closed by server")]
    StreamEnded,

    #[error("gave up connecting after {0} attempts")]
    GaveUp(u32),
}

/// Settings for the upstream subscription.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    /// Bearer access token.
    pub token: String,
    pub retry: BackoffPolicy,
    pub connect_timeout: Duration,
    /// Capacity of the frame and error channels.
    pub channel_capacity: usize,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>, retry: BackoffPolicy) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            retry,
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 100,
        }
    }
}

/// Live subscription. Dropping it stops the background task.
pub struct Subscription {
    pub frames: mpsc::Receiver<RawFrame>,
    pub errors: mpsc::Receiver<TransportError>,
    task: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Client for the upstream event stream.
///
/// Connecting retries forever with exponential backoff. When an established
/// stream drops, the drop is reported on the error channel and the client
/// subscribes again with the last seen event id after a pause. Pauses double
/// across consecutive drops and go back to the base wait once a stream has
/// delivered an event.
pub struct StreamClient {
    url: Url,
    config: StreamConfig,
    http: reqwest::Client,
    state: Arc<ConnectionState>,
}

impl StreamClient {
    pub fn new(config: StreamConfig, state: Arc<ConnectionState>) -> Result<Self, TransportError> {
        let url = Url::parse(&config.url).map_err(|e| TransportError::InvalidEndpoint {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            url,
            config,
            http,
            state,
        })
    }

    /// Start the subscription in a background task.
    ///
    /// Frames and transport errors arrive on separate channels. The task runs
    /// until `cancel` fires or the returned [`Subscription`] is dropped.
    pub fn subscribe(self, cancel: CancellationToken) -> Subscription {
        let (frames_tx, frames) = mpsc::channel(self.config.channel_capacity);
        let (errors_tx, errors) = mpsc::channel(self.config.channel_capacity);
        let task = tokio::spawn(self.run(frames_tx, errors_tx, cancel));
        Subscription {
            frames,
            errors,
            task,
        }
    }

    async fn open(&self, last_event_id: Option<&str>) -> Result<reqwest::Response, TransportError> {
        let mut request = self
            .http
            .get(self.url.clone())
            .bearer_auth(&self.config.token)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id {
            request = request.header("Last-Event-ID", id);
        }

        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => Ok(response),
            status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                Err(TransportError::Unauthorized(status))
            }
            status => Err(TransportError::Status(status)),
        }
    }

    async fn run(
        self,
        frames_tx: mpsc::Sender<RawFrame>,
        errors_tx: mpsc::Sender<TransportError>,
        cancel: CancellationToken,
    ) {
        let mut last_event_id: Option<String> = None;
        let mut resubscribe = self.config.retry.start();

        loop {
            info!("[Stream] Subscribing to {}", self.url);
            let connected = retry_with_backoff("Stream", &self.config.retry, &cancel, || {
                self.open(last_event_id.as_deref())
            })
            .await;

            let response = match connected {
                Ok(response) => response,
                Err(RetryError::Cancelled) => break,
                Err(RetryError::Exhausted { attempts, last }) => {
                    warn!("[Stream] Last connect error: {}", last);
                    let _ = errors_tx.send(TransportError::GaveUp(attempts)).await;
                    break;
                }
            };

            info!("[Stream] Connected to {}", self.url);
            self.state.set_connected();

            let mut parser = SseParser::new();
            let mut body = response.bytes_stream();
            let mut delivered = false;
            let error = loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        self.state.set_disconnected();
                        return;
                    }
                    chunk = body.next() => chunk,
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        for frame in parser.push(&bytes) {
                            delivered = true;
                            if let Some(id) = &frame.id {
                                last_event_id = Some(id.clone());
                            }
                            debug!("[Stream] Event {:?}: {} bytes", frame.event, frame.data.len());
                            if frames_tx.send(frame).await.is_err() {
                                debug!("[Stream] Frame receiver dropped, stopping");
                                self.state.set_disconnected();
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => break TransportError::Request(e),
                    None => break TransportError::StreamEnded,
                }
            };

            self.state.set_disconnected();
            if delivered {
                resubscribe.reset();
            }
            let delay = resubscribe.next_delay();
            warn!("[Stream] Subscription lost: {} (resubscribing in {:?})", error, delay);
            if errors_tx.send(error).await.is_err() {
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.set_disconnected();
        info!("[Stream] Subscription stopped");
    }
}
