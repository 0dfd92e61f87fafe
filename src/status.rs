//! Connection status of the upstream stream and the Fluentd sink.
//!
//! Each connection tracks whether it is connected right now and whether it
//! has ever connected. The health check only cares about the latter, so a
//! reconnect cycle after the first success does not flap it.

use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// State of one external connection.
#[derive(Debug)]
pub struct ConnectionState {
    name: &'static str,
    connected: AtomicBool,
    ever_connected: AtomicBool,
}

impl ConnectionState {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            connected: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn set_connected(&self) {
        self.ever_connected.store(true, Ordering::SeqCst);
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("[Status] {} connected", self.name);
        }
    }

    pub fn set_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("[Status] {} disconnected", self.name);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn has_connected(&self) -> bool {
        self.ever_connected.load(Ordering::SeqCst)
    }
}

/// Status of both connections, shared with the HTTP health check.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub upstream: Arc<ConnectionState>,
    pub sink: Arc<ConnectionState>,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self {
            upstream: Arc::new(ConnectionState::new("particle")),
            sink: Arc::new(ConnectionState::new("fluentd")),
        }
    }

    /// Names of connections that have not completed their first connect,
    /// sink first.
    pub fn never_connected(&self) -> Vec<&'static str> {
        [&self.sink, &self.upstream]
            .into_iter()
            .filter(|state| !state.has_connected())
            .map(|state| state.name())
            .collect()
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}
