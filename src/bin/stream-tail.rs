//! Tail the upstream event stream without forwarding anything.
//!
//! Usage:
//!   ACCESS_TOKEN_PATH=token.txt cargo run --bin stream-tail
//!
//! Subscribes to the Particle event stream with the same flags as the
//! aggregator, decodes every frame and logs the result. Useful for checking
//! what devices are sending before pointing a real Fluentd at it.

use clap::Parser;
use log::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use weather_aggregator::config::{Config, load_access_token};
use weather_aggregator::input::particle::StreamClient;
use weather_aggregator::status::ConnectionState;
use weather_aggregator::telemetry::decode;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    let token = match load_access_token(&config.access_token_path) {
        Ok(token) => token,
        Err(e) => {
            warn!("{}", e);
            std::process::exit(1);
        }
    };

    let state = Arc::new(ConnectionState::new("particle"));
    let client = match StreamClient::new(config.stream(token), state) {
        Ok(client) => client,
        Err(e) => {
            warn!("{}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let mut subscription = client.subscribe(cancel.clone());
    info!("Tailing {}... Press Ctrl+C to exit.", config.particle_url);

    let mut errors_open = true;
    loop {
        tokio::select! {
            frame = subscription.frames.recv() => match frame {
                Some(frame) => match decode(&frame.data) {
                    Ok(Some(reading)) => {
                        let metrics: Vec<String> = reading
                            .metrics
                            .present()
                            .map(|(metric, value)| format!("{}={}", metric.label(), value))
                            .collect();
                        info!(
                            ">>> {} @ {}: {}",
                            reading.device_id,
                            reading.timestamp,
                            metrics.join(" ")
                        );
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Undecodable frame ({}): {:?}", e, frame.data),
                },
                None => break,
            },
            error = subscription.errors.recv(), if errors_open => match error {
                Some(e) => warn!("Stream error: {}", e),
                None => errors_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                cancel.cancel();
                break;
            }
        }
    }
}
