use crate::backoff::BackoffPolicy;
use crate::error::{AggregatorError, Result};
use crate::input::particle::{PARTICLE_API_URL, StreamConfig};
use crate::output::FluentConfig;
use crate::pipeline::PipelineConfig;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command line flags, each with an environment variable fallback.
#[derive(Debug, Clone, Parser)]
#[command(name = "weather-aggregator", version, about)]
pub struct Config {
    /// The web server address.
    #[arg(long = "host", env = "ADDRESS", default_value = "0.0.0.0:8080")]
    pub address: String,

    /// The fluentd host.
    #[arg(long, env = "FLUENTD_HOST", default_value = "localhost")]
    pub fluentd_host: String,

    /// The fluentd port.
    #[arg(long, env = "FLUENTD_PORT", default_value_t = 24224)]
    pub fluentd_port: u16,

    /// Milliseconds to wait after the first failed fluentd connect; doubles per failure.
    #[arg(long = "fluentd-retry", env = "FLUENTD_RETRY_WAIT", default_value_t = 500)]
    pub fluentd_retry_ms: u64,

    /// Connection attempts before giving up on fluentd at startup.
    #[arg(long, env = "FLUENTD_MAX_RETRY", default_value_t = 240)]
    pub fluentd_max_retry: u32,

    /// Upper bound in milliseconds for a single wait between fluentd connects.
    #[arg(long = "fluentd-max-retry-wait", env = "FLUENTD_MAX_RETRY_WAIT", default_value_t = 60_000)]
    pub fluentd_max_retry_wait_ms: u64,

    /// Tag attached to every record sent to fluentd.
    #[arg(long, env = "FLUENTD_TAG", default_value = "weather_aggregator.sensordata")]
    pub fluentd_tag: String,

    /// Milliseconds a single send to fluentd may take.
    #[arg(long = "forward-timeout", env = "FORWARD_TIMEOUT", default_value_t = 5000)]
    pub forward_timeout_ms: u64,

    /// The path to a file containing the Particle API access token.
    #[arg(long, env = "ACCESS_TOKEN_PATH")]
    pub access_token_path: PathBuf,

    /// Particle event stream to subscribe to.
    #[arg(long, env = "PARTICLE_API_URL", default_value = PARTICLE_API_URL)]
    pub particle_url: String,

    /// Milliseconds to wait after the first failed Particle connect; doubles per failure.
    #[arg(long = "particle-retry", env = "PARTICLE_RETRY_WAIT", default_value_t = 500)]
    pub particle_retry_ms: u64,

    /// Upper bound in milliseconds for a single wait between Particle connects.
    #[arg(long = "particle-max-retry-wait", env = "PARTICLE_MAX_RETRY_WAIT", default_value_t = 60_000)]
    pub particle_max_retry_wait_ms: u64,

    /// Seconds without a reading before a device is marked inactive.
    #[arg(long = "device-timeout", env = "DEVICE_TIMEOUT", default_value_t = 300)]
    pub device_timeout_secs: u64,

    /// Milliseconds between device liveness sweeps.
    #[arg(long = "sweep-interval", env = "SWEEP_INTERVAL", default_value_t = 1000)]
    pub sweep_interval_ms: u64,

    /// Milliseconds an in-flight send may keep running after shutdown starts.
    #[arg(long = "shutdown-grace", env = "SHUTDOWN_GRACE", default_value_t = 5000)]
    pub shutdown_grace_ms: u64,
}

impl Config {
    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    pub fn fluent(&self) -> FluentConfig {
        FluentConfig {
            host: self.fluentd_host.clone(),
            port: self.fluentd_port,
            tag: self.fluentd_tag.clone(),
            retry: BackoffPolicy::new(Duration::from_millis(self.fluentd_retry_ms))
                .with_max_delay(Duration::from_millis(self.fluentd_max_retry_wait_ms))
                .with_max_attempts(self.fluentd_max_retry),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn stream(&self, token: String) -> StreamConfig {
        StreamConfig::new(
            self.particle_url.clone(),
            token,
            BackoffPolicy::new(Duration::from_millis(self.particle_retry_ms))
                .with_max_delay(Duration::from_millis(self.particle_max_retry_wait_ms)),
        )
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            forward_timeout: Duration::from_millis(self.forward_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

/// Read the Particle access token. Surrounding whitespace is ignored.
pub fn load_access_token(path: &Path) -> Result<String> {
    let contents =
        std::fs::read_to_string(path).map_err(|source| AggregatorError::CredentialUnreadable {
            path: path.to_path_buf(),
            source,
        })?;

    let token = contents.trim();
    if token.is_empty() {
        return Err(AggregatorError::CredentialEmpty(path.to_path_buf()));
    }
    Ok(token.to_string())
}
