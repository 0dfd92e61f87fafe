//! Upstream frame decoding.
//!
//! A frame is the `data` of one server-sent event: a JSON envelope whose own
//! `data` field carries a single LTSV record written by the device firmware,
//! e.g. `timestamp:1422568543\ttemp:21.5\thumidity:40.1`. Fields may use
//! either `:` or `=` between label and value.

use super::reading::{Metric, Metrics, NormalizedReading};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::num::ParseIntError;
use thiserror::Error;

/// Event envelope published by the device cloud.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "coreid")]
    pub device_id: String,
    pub data: String,
    #[serde(default)]
    pub ttl: Option<Ttl>,
    #[serde(default)]
    pub published_at: Option<String>,
}

/// The cloud has sent ttl both as a string and as a number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Ttl {
    Seconds(u64),
    Text(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("could not parse message envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("message envelope has an empty device id")]
    MissingDeviceId,

    #[error("expected exactly one record, found {0}")]
    RecordCount(usize),

    #[error("malformed field {0:?}")]
    MalformedField(String),

    #[error("record has no timestamp")]
    MissingTimestamp,

    #[error("invalid timestamp {value:?}: {source}")]
    InvalidTimestamp {
        value: String,
        #[source]
        source: ParseIntError,
    },
}

/// Decode one upstream frame.
///
/// Returns `Ok(None)` for empty frames, which the event source sends as
/// keep-alives.
pub fn decode(frame: &str) -> Result<Option<NormalizedReading>, DecodeError> {
    if frame.trim().is_empty() {
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_str(frame)?;
    if envelope.device_id.trim().is_empty() {
        return Err(DecodeError::MissingDeviceId);
    }

    let record = parse_record(&envelope.data)?;
    debug!("Got data from {}: {:?}", envelope.device_id, record);

    let raw_timestamp = record
        .get("timestamp")
        .ok_or(DecodeError::MissingTimestamp)?;
    let timestamp =
        raw_timestamp
            .trim()
            .parse::<i64>()
            .map_err(|source| DecodeError::InvalidTimestamp {
                value: raw_timestamp.clone(),
                source,
            })?;

    let mut metrics = Metrics::default();
    for metric in Metric::ALL {
        let Some(raw) = record.get(metric.label()) else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => metrics.set(metric, Some(value)),
            Ok(value) => warn!(
                "Ignoring non-finite {} value from {}: {}",
                metric.label(),
                envelope.device_id,
                value
            ),
            Err(e) => warn!(
                "Error parsing {} data from {}: {:?} ({})",
                metric.label(),
                envelope.device_id,
                raw,
                e
            ),
        }
    }

    Ok(Some(NormalizedReading {
        device_id: envelope.device_id,
        timestamp,
        metrics,
    }))
}

/// Parse LTSV text that must hold exactly one record.
///
/// Blank lines are skipped. Every tab-separated field must contain a label,
/// separated from its value by the first `:` or `=`.
pub fn parse_record(data: &str) -> Result<HashMap<String, String>, DecodeError> {
    let lines: Vec<&str> = data
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .collect();

    if lines.len() != 1 {
        return Err(DecodeError::RecordCount(lines.len()));
    }

    let mut record = HashMap::new();
    for field in lines[0].split('\t').filter(|f| !f.is_empty()) {
        let Some(split) = field.find([':', '=']) else {
            return Err(DecodeError::MalformedField(field.to_string()));
        };
        let label = field[..split].trim();
        if label.is_empty() {
            return Err(DecodeError::MalformedField(field.to_string()));
        }
        record.insert(label.to_string(), field[split + 1..].to_string());
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(device: &str, data: &str) -> String {
        serde_json::json!({
            "coreid": device,
            "data": data,
            "ttl": "60",
            "published_at": "2015-01-29T21:55:43.917Z",
        })
        .to_string()
    }

    #[test]
    fn test_decode_reading() {
        let reading = decode(&frame("dev-1", "timestamp=1000\ttemp=21.5"))
            .unwrap()
            .unwrap();
        assert_eq!(reading.device_id, "dev-1");
        assert_eq!(reading.timestamp, 1000);
        assert_eq!(reading.metrics.temperature, Some(21.5));
        assert_eq!(reading.metrics.humidity, None);
        assert_eq!(reading.metrics.rainfall, None);
    }

    #[test]
    fn test_decode_colon_labels() {
        let data = "timestamp:1422568543\ttemp:20.70\thumidity:41.20";
        let reading = decode(&frame("53ff6d065067544816300187", data))
            .unwrap()
            .unwrap();
        assert_eq!(reading.timestamp, 1422568543);
        assert_eq!(reading.metrics.temperature, Some(20.7));
        assert_eq!(reading.metrics.humidity, Some(41.2));
    }

    #[test]
    fn test_metric_presence_matches_record() {
        // Every subset of the six metrics must survive decoding as-is.
        for mask in 0u32..64 {
            let mut data = String::from("timestamp=5");
            for (i, metric) in Metric::ALL.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    data.push_str(&format!("\t{}={}", metric.label(), i as f64 + 0.5));
                }
            }
            let reading = decode(&frame("dev", &data)).unwrap().unwrap();
            for (i, metric) in Metric::ALL.iter().enumerate() {
                let expected = (mask & (1 << i) != 0).then_some(i as f64 + 0.5);
                assert_eq!(reading.metrics.get(*metric), expected, "mask {mask:#08b}");
            }
        }
    }

    #[test]
    fn test_empty_frame_is_keep_alive() {
        assert!(decode("").unwrap().is_none());
        assert!(decode("\n").unwrap().is_none());
    }

    #[test]
    fn test_malformed_envelope() {
        assert!(matches!(decode("not json"), Err(DecodeError::Envelope(_))));
        assert!(matches!(
            decode(r#"{"coreid":"dev-1"}"#),
            Err(DecodeError::Envelope(_))
        ));
    }

    #[test]
    fn test_empty_device_id() {
        assert!(matches!(
            decode(&frame("", "timestamp=1")),
            Err(DecodeError::MissingDeviceId)
        ));
    }

    #[test]
    fn test_record_count() {
        assert!(matches!(
            decode(&frame("dev", "")),
            Err(DecodeError::RecordCount(0))
        ));
        assert!(matches!(
            decode(&frame("dev", "timestamp=1\ttemp=2\ntimestamp=2\ttemp=3")),
            Err(DecodeError::RecordCount(2))
        ));
        // Trailing newline does not make a second record.
        assert!(decode(&frame("dev", "timestamp=1\ttemp=2\r\n")).is_ok());
    }

    #[test]
    fn test_unparseable_data() {
        assert!(matches!(
            decode(&frame("dev", "garbage")),
            Err(DecodeError::MalformedField(_))
        ));
        assert!(matches!(
            decode(&frame("dev", "timestamp=1\t=3")),
            Err(DecodeError::MalformedField(_))
        ));
    }

    #[test]
    fn test_timestamp_required() {
        assert!(matches!(
            decode(&frame("dev", "temp=21.5")),
            Err(DecodeError::MissingTimestamp)
        ));
        assert!(matches!(
            decode(&frame("dev", "timestamp=soon\ttemp=21.5")),
            Err(DecodeError::InvalidTimestamp { .. })
        ));
        assert!(matches!(
            decode(&frame("dev", "timestamp=10.5")),
            Err(DecodeError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_bad_metric_is_dropped() {
        let reading = decode(&frame("dev", "timestamp=7\ttemp=warm\thumidity=55\tpressure=NaN"))
            .unwrap()
            .unwrap();
        assert_eq!(reading.metrics.temperature, None);
        assert_eq!(reading.metrics.humidity, Some(55.0));
        assert_eq!(reading.metrics.pressure, None);
    }

    #[test]
    fn test_unknown_labels_ignored() {
        let reading = decode(&frame("dev", "timestamp=7\tbattery=3.9\tfw=1.0"))
            .unwrap()
            .unwrap();
        assert_eq!(reading.metrics, Metrics::default());
    }

    #[test]
    fn test_numeric_ttl_accepted() {
        let raw = r#"{"coreid":"dev","data":"timestamp=3","ttl":60,"published_at":"x"}"#;
        assert!(decode(raw).unwrap().is_some());
    }

    #[test]
    fn test_decode_is_deterministic() {
        let raw = frame("dev", "timestamp=3\twindspeed=4.25\twinddirection=270");
        assert_eq!(decode(&raw).unwrap(), decode(&raw).unwrap());
    }
}
