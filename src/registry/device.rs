use crate::telemetry::{Metrics, NormalizedReading};
use serde::ser::{Serialize, SerializeStruct, Serializer};

/// Last known state of one device.
///
/// `active` reflects the liveness check made by the most recent update or
/// sweep; it is not recomputed on read.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub id: String,
    pub metrics: Metrics,
    /// Timestamp of the latest reading (unix seconds).
    pub last_seen: i64,
    pub active: bool,
}

impl DeviceState {
    pub(crate) fn from_reading(reading: &NormalizedReading, active: bool) -> Self {
        Self {
            id: reading.device_id.clone(),
            metrics: reading.metrics,
            last_seen: reading.timestamp,
            active,
        }
    }
}

/// `now - last_seen < timeout`, with all values in seconds.
pub(crate) fn is_live(now: i64, last_seen: i64, timeout_secs: i64) -> bool {
    now.saturating_sub(last_seen) < timeout_secs
}

// The device listing keeps the `current_*` names dashboards already read.
impl Serialize for DeviceState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Device", 9)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("current_temp", &self.metrics.temperature)?;
        s.serialize_field("current_humidity", &self.metrics.humidity)?;
        s.serialize_field("current_pressure", &self.metrics.pressure)?;
        s.serialize_field("current_windspeed", &self.metrics.wind_speed)?;
        s.serialize_field("current_winddirection", &self.metrics.wind_direction)?;
        s.serialize_field("current_rainfall", &self.metrics.rainfall)?;
        s.serialize_field("last_seen", &self.last_seen)?;
        s.serialize_field("active", &self.active)?;
        s.end()
    }
}
