//! Device registry: the last known readings and liveness of every device.
//!
//! The registry is the only mutable state shared between the ingestion loop,
//! the liveness sweep and the HTTP listing. Every operation takes the lock
//! once and finishes before releasing it, so readers never observe a device
//! halfway through an update.

mod device;

pub use device::DeviceState;

use crate::telemetry::NormalizedReading;
use device::is_live;
use indexmap::IndexMap;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::time::Duration;

/// What an update did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// First reading from this device.
    Added,
    /// Known device, readings replaced.
    Updated,
    /// Known device that was active and is inactive after this (stale) reading.
    WentInactive,
}

/// Thread-safe map of device id to [`DeviceState`], in first-seen order.
pub struct Registry {
    devices: RwLock<IndexMap<String, DeviceState>>,
    liveness_timeout: Duration,
}

impl Registry {
    /// Create an empty registry. `liveness_timeout` is used by [`update`]
    /// to compute the `active` flag of the device it touches.
    ///
    /// [`update`]: Registry::update
    pub fn new(liveness_timeout: Duration) -> Self {
        Self {
            devices: RwLock::new(IndexMap::new()),
            liveness_timeout,
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Apply a reading using the current wall-clock time.
    pub fn update(&self, reading: &NormalizedReading) -> UpdateOutcome {
        self.update_at(reading, now_unix())
    }

    /// Apply a reading as of `now` (unix seconds).
    ///
    /// The reading's metric set replaces the stored one wholesale: a metric
    /// missing from the reading is cleared, not carried over.
    pub fn update_at(&self, reading: &NormalizedReading, now: i64) -> UpdateOutcome {
        let active = is_live(now, reading.timestamp, timeout_secs(self.liveness_timeout));
        let mut devices = self.devices.write();

        match devices.get_mut(&reading.device_id) {
            Some(device) => {
                let was_active = device.active;
                device.metrics = reading.metrics;
                device.last_seen = reading.timestamp;
                device.active = active;
                debug!("[Registry] Updated device {}", device.id);

                if was_active && !active {
                    warn!("[Registry] Device no longer active: {}", device.id);
                    UpdateOutcome::WentInactive
                } else {
                    UpdateOutcome::Updated
                }
            }
            None => {
                info!("[Registry] New device: {}", reading.device_id);
                devices.insert(
                    reading.device_id.clone(),
                    DeviceState::from_reading(reading, active),
                );
                UpdateOutcome::Added
            }
        }
    }

    /// Recompute every device's `active` flag as of `now`.
    ///
    /// Returns the number of devices that went from active to inactive.
    /// Devices are never removed; a second sweep with the same `now` finds
    /// nothing to change.
    pub fn sweep(&self, now: i64, timeout: Duration) -> usize {
        let timeout = timeout_secs(timeout);
        let mut devices = self.devices.write();
        let mut transitions = 0;

        for device in devices.values_mut() {
            let active = is_live(now, device.last_seen, timeout);
            if device.active && !active {
                warn!("[Registry] Device no longer active: {}", device.id);
                transitions += 1;
            }
            device.active = active;
        }

        transitions
    }

    /// Copy of all device states, in first-seen order.
    pub fn snapshot(&self) -> Vec<DeviceState> {
        self.devices.read().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<DeviceState> {
        self.devices.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

/// Current wall-clock time in unix seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn timeout_secs(timeout: Duration) -> i64 {
    i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX)
}
