use serde::{Deserialize, Serialize};

/// The six measurements a weather station may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Temperature,
    Humidity,
    Pressure,
    WindSpeed,
    WindDirection,
    Rainfall,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Temperature,
        Metric::Humidity,
        Metric::Pressure,
        Metric::WindSpeed,
        Metric::WindDirection,
        Metric::Rainfall,
    ];

    /// Label used in device records and in the records sent to Fluentd.
    pub fn label(self) -> &'static str {
        match self {
            Metric::Temperature => "temp",
            Metric::Humidity => "humidity",
            Metric::Pressure => "pressure",
            Metric::WindSpeed => "windspeed",
            Metric::WindDirection => "winddirection",
            Metric::Rainfall => "rainfall",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.label() == label)
    }
}

/// Optional metric set. A reading carries exactly the metrics its record
/// contained; there are no sentinel values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub rainfall: Option<f64>,
}

impl Metrics {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Temperature => self.temperature,
            Metric::Humidity => self.humidity,
            Metric::Pressure => self.pressure,
            Metric::WindSpeed => self.wind_speed,
            Metric::WindDirection => self.wind_direction,
            Metric::Rainfall => self.rainfall,
        }
    }

    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        let slot = match metric {
            Metric::Temperature => &mut self.temperature,
            Metric::Humidity => &mut self.humidity,
            Metric::Pressure => &mut self.pressure,
            Metric::WindSpeed => &mut self.wind_speed,
            Metric::WindDirection => &mut self.wind_direction,
            Metric::Rainfall => &mut self.rainfall,
        };
        *slot = value;
    }

    /// Present metrics in canonical order.
    pub fn present(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        Metric::ALL
            .into_iter()
            .filter_map(|m| self.get(m).map(|v| (m, v)))
    }
}

/// One decoded, validated reading from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReading {
    pub device_id: String,
    /// Device-reported sample time (unix seconds).
    pub timestamp: i64,
    pub metrics: Metrics,
}
