//! Value formatting for reported metrics
//!
//! Pure transforms only: byte unit conversion, decimal rounding, the unit /
//! device-class tables and the expansion of composite readings into one
//! sensor update per sub-key.

use crate::config::FormattingConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::metrics::{MetricKind, MetricValue, Number};
use crate::report::{SensorState, SensorUpdate};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteUnit {
    B,
    KB,
    MB,
    GB,
    TB,
}

impl ByteUnit {
    pub fn factor(&self) -> f64 {
        match self {
            ByteUnit::B => 1.0,
            ByteUnit::KB => 1024.0,
            ByteUnit::MB => 1024.0 * 1024.0,
            ByteUnit::GB => 1024.0 * 1024.0 * 1024.0,
            ByteUnit::TB => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ByteUnit::B => "B",
            ByteUnit::KB => "KB",
            ByteUnit::MB => "MB",
            ByteUnit::GB => "GB",
            ByteUnit::TB => "TB",
        }
    }

    pub fn convert(&self, bytes: f64) -> f64 {
        bytes / self.factor()
    }

    /// Spelling Home Assistant accepts for the `data_size` device class.
    pub fn unit_of_measurement(&self) -> &'static str {
        match self {
            ByteUnit::KB => "kB",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for ByteUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ByteUnit {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "B" => Ok(ByteUnit::B),
            "KB" => Ok(ByteUnit::KB),
            "MB" => Ok(ByteUnit::MB),
            "GB" => Ok(ByteUnit::GB),
            "TB" => Ok(ByteUnit::TB),
            _ => Err(MonitorError::InvalidUnit(s.to_string())),
        }
    }
}

/// Convert a byte count into `unit` (B, KB, MB, GB, TB).
pub fn convert_bytes(value: f64, unit: &str) -> MonitorResult<f64> {
    Ok(unit.parse::<ByteUnit>()?.convert(value))
}

/// Round floats to `places` decimals; integers pass through.
pub fn round_value(value: Number, places: u32) -> Number {
    match value {
        Number::Float(v) if v.is_finite() => {
            let factor = 10f64.powi(places as i32);
            Number::Float((v * factor).round() / factor)
        }
        other => other,
    }
}

#[derive(Debug, Clone)]
pub struct Formatter {
    disk_unit: ByteUnit,
    memory_unit: ByteUnit,
    network_unit: ByteUnit,
    decimal_places: u32,
}

impl Default for Formatter {
    fn default() -> Self {
        Self {
            disk_unit: ByteUnit::GB,
            memory_unit: ByteUnit::GB,
            network_unit: ByteUnit::MB,
            decimal_places: 2,
        }
    }
}

impl Formatter {
    pub fn new(
        disk_unit: ByteUnit,
        memory_unit: ByteUnit,
        network_unit: ByteUnit,
        decimal_places: u32,
    ) -> Self {
        Self {
            disk_unit,
            memory_unit,
            network_unit,
            decimal_places,
        }
    }

    pub fn from_config(config: &FormattingConfig) -> MonitorResult<Self> {
        Ok(Self::new(
            config.disk_unit.parse()?,
            config.memory_unit.parse()?,
            config.network_unit.parse()?,
            config.decimal_places,
        ))
    }

    pub fn round(&self, value: Number) -> Number {
        round_value(value, self.decimal_places)
    }

    fn convert_and_round(&self, value: Number, unit: ByteUnit) -> Number {
        self.round(Number::Float(unit.convert(value.as_f64())))
    }

    /// `total`/`used`/`free` in the disk unit, `percent` only rounded.
    pub fn format_disk_usage(&self, fields: &BTreeMap<String, Number>) -> BTreeMap<String, Number> {
        self.format_capacity(fields, self.disk_unit)
    }

    pub fn format_memory_info(&self, fields: &BTreeMap<String, Number>) -> BTreeMap<String, Number> {
        self.format_capacity(fields, self.memory_unit)
    }

    fn format_capacity(
        &self,
        fields: &BTreeMap<String, Number>,
        unit: ByteUnit,
    ) -> BTreeMap<String, Number> {
        fields
            .iter()
            .map(|(key, value)| {
                let formatted = if key == "percent" {
                    self.round(*value)
                } else {
                    self.convert_and_round(*value, unit)
                };
                (key.clone(), formatted)
            })
            .collect()
    }

    /// Only `bytes_*` counters are converted; packet and error counters are left as-is.
    pub fn format_network_io(&self, fields: &BTreeMap<String, Number>) -> BTreeMap<String, Number> {
        fields
            .iter()
            .map(|(key, value)| {
                let formatted = if key.starts_with("bytes_") {
                    self.convert_and_round(*value, self.network_unit)
                } else {
                    *value
                };
                (key.clone(), formatted)
            })
            .collect()
    }

    pub fn format_load_average(&self, fields: &BTreeMap<String, Number>) -> BTreeMap<String, Number> {
        self.round_all(fields)
    }

    fn round_all(&self, fields: &BTreeMap<String, Number>) -> BTreeMap<String, Number> {
        fields
            .iter()
            .map(|(key, value)| (key.clone(), self.round(*value)))
            .collect()
    }

    pub fn format_memory(&self, bytes: Number) -> Number {
        self.convert_and_round(bytes, self.memory_unit)
    }

    /// Apply the transform appropriate to `kind`.
    pub fn format(&self, kind: MetricKind, value: MetricValue) -> MonitorResult<MetricValue> {
        let formatted = match (kind, value) {
            (MetricKind::MemoryAvailable, MetricValue::Scalar(n)) => {
                MetricValue::Scalar(self.format_memory(n))
            }
            (
                MetricKind::CpuPercent
                | MetricKind::MemoryPercent
                | MetricKind::CpuCount
                | MetricKind::ProcessCount
                | MetricKind::Uptime,
                MetricValue::Scalar(n),
            ) => MetricValue::Scalar(self.round(n)),
            (MetricKind::BootTime, MetricValue::Text(text)) => MetricValue::Text(text),
            (MetricKind::DiskUsage, MetricValue::Composite(fields)) => {
                MetricValue::Composite(self.format_disk_usage(&fields))
            }
            (MetricKind::MemoryInfo, MetricValue::Composite(fields)) => {
                MetricValue::Composite(self.format_memory_info(&fields))
            }
            (MetricKind::NetworkIo, MetricValue::Composite(fields)) => {
                MetricValue::Composite(self.format_network_io(&fields))
            }
            (MetricKind::LoadAverage, MetricValue::Composite(fields)) => {
                MetricValue::Composite(self.format_load_average(&fields))
            }
            (MetricKind::CpuTemp, MetricValue::Composite(fields)) => {
                MetricValue::Composite(self.round_all(&fields))
            }
            (kind, other) => {
                return Err(MonitorError::FormatError {
                    metric: kind.to_string(),
                    reason: format!("unexpected value shape: {other:?}"),
                })
            }
        };
        Ok(formatted)
    }

    /// Canonical unit table, keyed by metric and (for composites) sub-key.
    pub fn unit_for(&self, kind: MetricKind, sub_key: Option<&str>) -> Option<&'static str> {
        match kind {
            MetricKind::CpuPercent | MetricKind::MemoryPercent => Some("%"),
            MetricKind::CpuCount => Some("cores"),
            MetricKind::MemoryAvailable => Some(self.memory_unit.unit_of_measurement()),
            MetricKind::MemoryInfo => match sub_key {
                Some("percent") => Some("%"),
                _ => Some(self.memory_unit.unit_of_measurement()),
            },
            MetricKind::DiskUsage => match sub_key {
                Some("percent") => Some("%"),
                _ => Some(self.disk_unit.unit_of_measurement()),
            },
            MetricKind::NetworkIo => match sub_key {
                Some(key) if key.starts_with("bytes_") => Some(self.network_unit.unit_of_measurement()),
                Some(key) if key.starts_with("packets_") => Some("packets"),
                Some(_) => Some("errors"),
                None => None,
            },
            MetricKind::Uptime => Some("s"),
            MetricKind::ProcessCount => Some("processes"),
            MetricKind::CpuTemp => Some("°C"),
            MetricKind::LoadAverage | MetricKind::BootTime => None,
        }
    }

    pub fn device_class_for(&self, kind: MetricKind, sub_key: Option<&str>) -> Option<&'static str> {
        match (kind, sub_key) {
            (MetricKind::CpuTemp, _) => Some("temperature"),
            (MetricKind::Uptime, _) => Some("duration"),
            (MetricKind::BootTime, _) => Some("timestamp"),
            (MetricKind::MemoryAvailable, _) => Some("data_size"),
            (MetricKind::DiskUsage | MetricKind::MemoryInfo, Some(key)) if key != "percent" => {
                Some("data_size")
            }
            (MetricKind::NetworkIo, Some(key)) if key.starts_with("bytes_") => Some("data_size"),
            _ => None,
        }
    }

    pub fn state_class_for(&self, kind: MetricKind) -> Option<&'static str> {
        match kind {
            MetricKind::BootTime => None,
            MetricKind::NetworkIo => Some("total_increasing"),
            _ => Some("measurement"),
        }
    }

    /// Expand a formatted reading into sensor updates: one for scalars and
    /// text, one per sub-key (`<metric>_<sub_key>`) for composites.
    pub fn flatten(&self, kind: MetricKind, value: MetricValue) -> Vec<SensorUpdate> {
        match value {
            MetricValue::Scalar(n) => vec![self.sensor(kind, None, SensorState::Number(n))],
            MetricValue::Text(text) => vec![self.sensor(kind, None, SensorState::Text(text))],
            MetricValue::Composite(fields) => fields
                .into_iter()
                .map(|(sub_key, n)| {
                    let mut update = self.sensor(kind, Some(&sub_key), SensorState::Number(n));
                    update
                        .attributes
                        .insert("parent_metric".to_string(), kind.as_str().into());
                    update
                })
                .collect(),
        }
    }

    fn sensor(&self, kind: MetricKind, sub_key: Option<&str>, state: SensorState) -> SensorUpdate {
        let key = match sub_key {
            Some(sub_key) => format!("{kind}_{sub_key}"),
            None => kind.to_string(),
        };
        SensorUpdate {
            key,
            state,
            unit: self.unit_for(kind, sub_key).map(str::to_string),
            device_class: self.device_class_for(kind, sub_key).map(str::to_string),
            state_class: self.state_class_for(kind).map(str::to_string),
            attributes: serde_json::Map::new(),
        }
    }
}
