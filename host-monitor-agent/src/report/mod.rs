//! Reporting backends for Home Assistant
//!
//! Two implementations behind one capability trait, picked once at startup:
//! - `RestReporter`: `POST /api/states/<entity_id>` per sensor
//! - `MqttReporter`: MQTT Discovery config (once) + state publish

pub mod mqtt;
pub mod rest;

use crate::config::{AppConfig, ReportMode};
use crate::error::MonitorResult;
use crate::metrics::Number;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub use mqtt::MqttReporter;
pub use rest::RestReporter;

/// Upper bound for connection checks and the post-connect readiness wait.
pub const READY_TIMEOUT: Duration = Duration::from_secs(1);

/// Sensor state as sent to the hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SensorState {
    Number(Number),
    Text(String),
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorState::Number(n) => write!(f, "{n}"),
            SensorState::Text(text) => f.write_str(text),
        }
    }
}

/// One sensor value for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorUpdate {
    /// Metric name, or `<metric>_<sub_key>` for composite readings.
    pub key: String,
    pub state: SensorState,
    pub unit: Option<String>,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl SensorUpdate {
    /// `disk_usage_percent` -> `Disk Usage Percent`
    pub fn friendly_name(&self) -> String {
        self.key
            .split('_')
            .filter(|word| !word.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportResult {
    pub success: bool,
    pub error: Option<String>,
}

impl ReportResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Per-identifier outcome of one publish call.
pub type ReportResults = BTreeMap<String, ReportResult>;

#[async_trait]
pub trait ReportBackend: Send {
    fn name(&self) -> &'static str;

    /// Start whatever background machinery the backend needs. Returns
    /// immediately; connection progress is observed asynchronously.
    async fn connect(&mut self) -> MonitorResult<()> {
        Ok(())
    }

    /// Wait up to `timeout` for a started connection to become usable.
    /// Backends without a handshake are always ready.
    async fn wait_ready(&mut self, _timeout: Duration) -> bool {
        true
    }

    /// Send every update. Individual failures are reported per identifier;
    /// `Err` means the backend itself is unusable (for example closed).
    async fn publish(&mut self, updates: &[SensorUpdate]) -> MonitorResult<ReportResults>;

    /// Synchronous connectivity probe used at startup.
    async fn test_connection(&mut self) -> (bool, Option<String>);

    async fn close(&mut self);
}

/// Build the backend selected by `report_mode`.
pub fn build_backend(config: &AppConfig) -> MonitorResult<Box<dyn ReportBackend>> {
    let backend: Box<dyn ReportBackend> = match config.report_mode {
        ReportMode::RestApi => Box::new(RestReporter::new(
            &config.home_assistant,
            &config.entity_prefix,
        )?),
        ReportMode::Mqtt => Box::new(MqttReporter::new(&config.mqtt, &config.entity_prefix)),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_friendly_name() {
        let update = SensorUpdate {
            key: "disk_usage_percent".to_string(),
            state: SensorState::Number(Number::Float(1.0)),
            unit: None,
            device_class: None,
            state_class: None,
            attributes: serde_json::Map::new(),
        };
        assert_eq!(update.friendly_name(), "Disk Usage Percent");
    }

    #[test]
    fn test_sensor_state_display() {
        assert_eq!(SensorState::Number(Number::Int(12)).to_string(), "12");
        assert_eq!(SensorState::Number(Number::Float(0.5)).to_string(), "0.5");
        assert_eq!(SensorState::Text("up".to_string()).to_string(), "up");
    }

    #[test]
    fn test_build_backend_follows_report_mode() {
        let mut config = AppConfig::default();
        config.entity_prefix = "nas_monitor".to_string();
        config.home_assistant.token = "secret".to_string();
        assert_eq!(build_backend(&config).unwrap().name(), "rest_api");

        config.report_mode = ReportMode::Mqtt;
        assert_eq!(build_backend(&config).unwrap().name(), "mqtt");
    }
}
