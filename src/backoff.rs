//! Exponential backoff for (re)connecting to external services.
//!
//! Both the upstream event stream and the Fluentd sink establish their
//! connections through [`retry_with_backoff`]. Each call starts a fresh
//! [`Backoff`] at the base interval, so the delay resets as soon as a
//! connection succeeds and the caller later has to reconnect.

use log::{error, info, warn};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Retry policy for one kind of connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Wait after the first failure.
    pub base: Duration,
    /// Upper bound for a single wait. `None` lets the delay keep doubling.
    pub max_delay: Option<Duration>,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    /// Retry forever, doubling from `base`.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            max_delay: None,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = Some(max);
        self
    }

    /// Start a new delay sequence at the base interval.
    pub fn start(&self) -> Backoff {
        Backoff {
            base: self.base,
            max: self.max_delay,
            current: self.base,
        }
    }
}

/// Delay sequence `base, 2*base, 4*base, ...`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
    current: Duration,
}

impl Backoff {
    /// Return the wait for this failure and double the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let doubled = self.current.saturating_mul(2);
        self.current = match self.max {
            Some(max) => doubled.min(max),
            None => doubled,
        };
        delay
    }

    /// Go back to the base interval after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("cancelled while connecting")]
    Cancelled,
}

/// Run `connect` until it succeeds, sleeping with exponential backoff
/// between failures.
///
/// Every failure is logged under `label`. Returns early with
/// [`RetryError::Cancelled`] when `cancel` fires, either mid-attempt or
/// mid-sleep, and with [`RetryError::Exhausted`] once the policy's attempt
/// ceiling is reached.
pub async fn retry_with_backoff<T, E, F, Fut>(
    label: &str,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut connect: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut backoff = policy.start();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        info!("[{}] Connecting...", label);

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = connect() => result,
        };

        match result {
            Ok(value) => {
                info!("[{}] Connected after {} attempt(s)", label, attempt);
                return Ok(value);
            }
            Err(e) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    error!("[{}] Giving up after {} attempts: {}", label, attempt, e);
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }

                let delay = backoff.next_delay();
                warn!("[{}] Could not connect: {} (retrying in {:?})", label, e, delay);

                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
