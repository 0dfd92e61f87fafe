//! HTTP status and device listing endpoints.
//!
//! - `GET /_status/healthz`: `OK`, or 500 naming connections that never came up
//! - `GET /_status/version`: crate version
//! - `GET /api/devices`: registry snapshot as JSON

use crate::registry::{DeviceState, Registry};
use crate::status::ConnectionStatus;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use log::info;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub status: ConnectionStatus,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/_status/healthz", get(health))
        .route("/_status/version", get(version))
        .route("/api/devices", get(devices))
        .with_state(state)
}

/// Serve until `cancel` fires, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("[HTTP] Listening on {}...", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn health(State(state): State<AppState>) -> Response {
    let missing = state.status.never_connected();
    if missing.is_empty() {
        return (StatusCode::OK, "OK").into_response();
    }

    let body = missing
        .iter()
        .map(|name| format!("{}: Not connected.", name))
        .collect::<Vec<_>>()
        .join("\n");
    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
}

async fn version() -> String {
    format!("{}\n", VERSION)
}

async fn devices(State(state): State<AppState>) -> Json<Vec<DeviceState>> {
    Json(state.registry.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Metrics, NormalizedReading};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get_raw(addr: std::net::SocketAddr, path: &str) -> (u16, String) {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        socket.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        socket.read_to_string(&mut response).await.unwrap();

        let status = response[9..12].parse().unwrap();
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default();
        (status, body)
    }

    async fn start(state: AppState) -> (std::net::SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, state, cancel.clone()));
        (addr, cancel)
    }

    fn state() -> AppState {
        AppState {
            registry: Arc::new(Registry::new(Duration::from_secs(300))),
            status: ConnectionStatus::new(),
        }
    }

    #[tokio::test]
    async fn test_health_reports_missing_connections() {
        let state = state();
        let (addr, cancel) = start(state.clone()).await;

        let (status, body) = get_raw(addr, "/_status/healthz").await;
        assert_eq!(status, 500);
        assert!(body.contains("fluentd: Not connected."));
        assert!(body.contains("particle: Not connected."));

        state.status.sink.set_connected();
        state.status.upstream.set_connected();
        state.status.upstream.set_disconnected();

        let (status, body) = get_raw(addr, "/_status/healthz").await;
        assert_eq!(status, 200);
        assert_eq!(body, "OK");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_devices_lists_snapshot() {
        let state = state();
        state.registry.update_at(
            &NormalizedReading {
                device_id: "dev-1".to_string(),
                timestamp: 1000,
                metrics: Metrics {
                    temperature: Some(21.5),
                    ..Metrics::default()
                },
            },
            1000,
        );
        let (addr, cancel) = start(state).await;

        let (status, body) = get_raw(addr, "/api/devices").await;
        assert_eq!(status, 200);
        let devices: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(devices[0]["id"], "dev-1");
        assert_eq!(devices[0]["current_temp"], 21.5);
        assert!(devices[0]["current_humidity"].is_null());
        assert_eq!(devices[0]["last_seen"], 1000);
        assert_eq!(devices[0]["active"], true);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_version() {
        let (addr, cancel) = start(state()).await;
        let (status, body) = get_raw(addr, "/_status/version").await;
        assert_eq!(status, 200);
        assert_eq!(body.trim(), VERSION);
        cancel.cancel();
    }
}
