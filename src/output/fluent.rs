//! Fluentd forward-protocol sink.
//!
//! Records are written in the forward protocol's JSON mode, one
//! `[tag, time, record]` array per reading, which `in_forward` accepts on
//! the same port as MessagePack.

use super::{ForwardError, ReadingSink};
use crate::backoff::{BackoffPolicy, RetryError, retry_with_backoff};
use crate::status::ConnectionState;
use crate::telemetry::NormalizedReading;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Connection settings for the Fluentd sink.
#[derive(Debug, Clone)]
pub struct FluentConfig {
    pub host: String,
    pub port: u16,
    pub tag: String,
    pub retry: BackoffPolicy,
    /// Bound on a single TCP connect attempt.
    pub connect_timeout: Duration,
}

impl FluentConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Record body as Fluentd sees it. Absent metrics are left out entirely.
#[derive(Debug, Serialize)]
struct SensorRecord<'a> {
    deviceid: &'a str,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    windspeed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    winddirection: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rainfall: Option<f64>,
}

impl<'a> From<&'a NormalizedReading> for SensorRecord<'a> {
    fn from(reading: &'a NormalizedReading) -> Self {
        let m = &reading.metrics;
        Self {
            deviceid: &reading.device_id,
            timestamp: reading.timestamp,
            temp: m.temperature,
            humidity: m.humidity,
            pressure: m.pressure,
            windspeed: m.wind_speed,
            winddirection: m.wind_direction,
            rainfall: m.rainfall,
        }
    }
}

/// Encode one forward-protocol message.
pub fn encode_message(
    tag: &str,
    time: i64,
    reading: &NormalizedReading,
) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&(tag, time, SensorRecord::from(reading)))
}

/// Sink that posts readings to Fluentd over TCP.
pub struct FluentSink {
    address: String,
    tag: String,
    connect_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    state: Arc<ConnectionState>,
}

impl FluentSink {
    /// Connect to Fluentd, retrying with backoff until the policy's attempt
    /// ceiling is reached or `cancel` fires.
    pub async fn connect(
        config: &FluentConfig,
        state: Arc<ConnectionState>,
        cancel: &CancellationToken,
    ) -> Result<Self, RetryError<io::Error>> {
        let address = config.address();
        info!("[Sink] Connecting to Fluentd ({})...", address);

        let stream = retry_with_backoff("Sink", &config.retry, cancel, || {
            open(&address, config.connect_timeout)
        })
        .await?;

        info!("[Sink] Connected to Fluentd ({})", address);
        state.set_connected();

        Ok(Self {
            address,
            tag: config.tag.clone(),
            connect_timeout: config.connect_timeout,
            stream: Mutex::new(Some(stream)),
            state,
        })
    }
}

#[async_trait]
impl ReadingSink for FluentSink {
    async fn forward(&self, reading: &NormalizedReading) -> Result<(), ForwardError> {
        let payload = encode_message(&self.tag, chrono::Utc::now().timestamp(), reading)?;
        let mut guard = self.stream.lock().await;

        // A dropped connection gets exactly one reconnect attempt per send.
        // The stream stays out of the slot while a write is in flight: if this
        // future is dropped mid-write the half-written connection goes with it.
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => {
                debug!("[Sink] Reconnecting to {}", self.address);
                let stream = open(&self.address, self.connect_timeout)
                    .await
                    .map_err(ForwardError::Reconnect)?;
                self.state.set_connected();
                stream
            }
        };

        if let Err(e) = stream.write_all(&payload).await {
            warn!("[Sink] Connection to {} lost: {}", self.address, e);
            self.state.set_disconnected();
            return Err(e.into());
        }

        *guard = Some(stream);
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("[Sink] Error closing connection: {}", e);
            }
            info!("[Sink] Connection to {} closed", self.address);
        }
        self.state.set_disconnected();
    }
}

async fn open(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Metrics;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn reading() -> NormalizedReading {
        NormalizedReading {
            device_id: "dev-1".to_string(),
            timestamp: 1000,
            metrics: Metrics {
                temperature: Some(21.5),
                wind_direction: Some(270.0),
                ..Metrics::default()
            },
        }
    }

    fn config(port: u16, max_attempts: u32) -> FluentConfig {
        FluentConfig {
            host: "127.0.0.1".to_string(),
            port,
            tag: "weather.test".to_string(),
            retry: BackoffPolicy::new(Duration::from_millis(10)).with_max_attempts(max_attempts),
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_encode_omits_absent_metrics() {
        let bytes = encode_message("weather.test", 1422568543, &reading()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            serde_json::json!([
                "weather.test",
                1422568543,
                { "deviceid": "dev-1", "timestamp": 1000, "temp": 21.5, "winddirection": 270.0 }
            ])
        );
    }

    #[tokio::test]
    async fn test_forward_writes_record() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let state = Arc::new(ConnectionState::new("fluentd"));
        let sink = FluentSink::connect(&config(port, 3), state.clone(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(state.is_connected());

        tokio_test::assert_ok!(sink.forward(&reading()).await);
        sink.close().await;
        assert!(!state.is_connected());

        let received = server.await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&received).unwrap();
        assert_eq!(value[0], "weather.test");
        assert_eq!(value[2]["deviceid"], "dev-1");
        assert_eq!(value[2]["temp"], 21.5);
        assert!(value[2].get("humidity").is_none());
    }

    #[tokio::test]
    async fn test_connect_gives_up_at_ceiling() {
        // Grab a free port, then release it so nothing is listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let state = Arc::new(ConnectionState::new("fluentd"));
        let result =
            FluentSink::connect(&config(port, 2), state.clone(), &CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 2, .. })
        ));
        assert!(!state.has_connected());
    }

    #[tokio::test]
    async fn test_forward_after_close_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut payloads = Vec::new();
            for _ in 0..2 {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                socket.read_to_end(&mut buf).await.unwrap();
                payloads.push(buf);
            }
            payloads
        });

        let state = Arc::new(ConnectionState::new("fluentd"));
        let sink = FluentSink::connect(&config(port, 3), state.clone(), &CancellationToken::new())
            .await
            .unwrap();
        sink.close().await;

        tokio_test::assert_ok!(sink.forward(&reading()).await);
        assert!(state.is_connected());
        sink.close().await;

        let payloads = server.await.unwrap();
        assert!(payloads[0].is_empty());
        assert!(!payloads[1].is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_write_discards_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            // The first peer never reads, so its socket buffers fill up.
            let (stalled, _) = listener.accept().await.unwrap();
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            drop(stalled);
            buf
        });

        let state = Arc::new(ConnectionState::new("fluentd"));
        let sink = FluentSink::connect(&config(port, 3), state.clone(), &CancellationToken::new())
            .await
            .unwrap();

        let mut interrupted = false;
        for _ in 0..1_000_000 {
            let r = reading();
            let send = tokio::time::timeout(Duration::from_millis(50), sink.forward(&r));
            if send.await.is_err() {
                interrupted = true;
                break;
            }
        }
        assert!(interrupted);

        // The next send goes out on a fresh connection.
        tokio_test::assert_ok!(sink.forward(&reading()).await);
        sink.close().await;

        let received = server.await.unwrap();
        let records = serde_json::Deserializer::from_slice(&received)
            .into_iter::<serde_json::Value>()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0][2]["deviceid"], "dev-1");
    }
}
