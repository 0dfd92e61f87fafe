use clap::Parser;
use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use weather_aggregator::backoff::RetryError;
use weather_aggregator::config::{Config, load_access_token};
use weather_aggregator::error::{AggregatorError, Result};
use weather_aggregator::http::{self, AppState, VERSION};
use weather_aggregator::input::particle::StreamClient;
use weather_aggregator::output::FluentSink;
use weather_aggregator::pipeline::Pipeline;
use weather_aggregator::registry::Registry;
use weather_aggregator::status::ConnectionStatus;

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logger();
    let config = Config::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Starting Weather Aggregator {}", VERSION);
    info!("  Fluentd: {}:{}", config.fluentd_host, config.fluentd_port);
    info!("  Particle: {}", config.particle_url);
    info!("  Device timeout: {}s", config.device_timeout_secs);

    // Everything that can stop the process happens before any task starts.
    let token = load_access_token(&config.access_token_path)?;
    let status = ConnectionStatus::new();
    let client = StreamClient::new(config.stream(token), status.upstream.clone())
        .map_err(|e| AggregatorError::InvalidEndpoint(e.to_string()))?;
    let listener = TcpListener::bind(&config.address)
        .await
        .map_err(|source| AggregatorError::HttpBind {
            addr: config.address.clone(),
            source,
        })?;

    let registry = Arc::new(Registry::new(config.device_timeout()));
    let cancel = CancellationToken::new();

    let app_state = AppState {
        registry: registry.clone(),
        status: status.clone(),
    };
    let http_cancel = cancel.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http::serve(listener, app_state, http_cancel.clone()).await {
            error!("[HTTP] Server error: {}", e);
            http_cancel.cancel();
        }
    });

    tokio::spawn(shutdown_signal(cancel.clone()));

    let result = ingest(&config, client, registry, status, cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = http_task.await {
        error!("[HTTP] Server task failed: {}", e);
    }

    info!("Weather Aggregator stopped");
    result
}

/// Connect the sink, subscribe upstream, and run the pipeline until shutdown.
async fn ingest(
    config: &Config,
    client: StreamClient,
    registry: Arc<Registry>,
    status: ConnectionStatus,
    cancel: CancellationToken,
) -> Result<()> {
    let sink = match FluentSink::connect(&config.fluent(), status.sink.clone(), &cancel).await {
        Ok(sink) => Arc::new(sink),
        Err(RetryError::Cancelled) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let subscription = client.subscribe(cancel.clone());
    Pipeline::new(registry, sink, config.pipeline())
        .run(subscription, cancel)
        .await;
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received shutdown signal"),
        _ = terminate => info!("Received SIGTERM"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
