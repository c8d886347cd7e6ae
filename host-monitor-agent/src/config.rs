//! Configuration management
//!
//! Handles:
//! - Default configuration creation on first start
//! - Deep merge of the user's `config.toml` over the defaults
//! - Host identifier / entity prefix resolution
//! - Validation (fails fast on missing hub credentials or bad frequencies)

use crate::error::{ErrorLog, MonitorError, MonitorResult};
use crate::formatter::ByteUnit;
use crate::metrics::{MetricKind, MetricSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const ERROR_LOG_FILE_NAME: &str = "error.log";
pub const CONTAINER_CONFIG_DIR: &str = "/app/config";

/// Lowest accepted global update frequency, in seconds.
pub const MIN_UPDATE_FREQUENCY_SECS: u64 = 5;
const MAX_DECIMAL_PLACES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    RestApi,
    Mqtt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub report_mode: ReportMode,
    /// Global frequency in seconds, used by metrics without their own.
    pub update_frequency: u64,
    /// `auto` uses the hostname, anything else is used verbatim (sanitized).
    pub host_identifier: String,
    pub home_assistant: HomeAssistantConfig,
    pub mqtt: MqttConfig,
    pub formatting: FormattingConfig,
    pub metrics: BTreeMap<String, MetricSettings>,
    /// Resolved from `host_identifier` at load time, never persisted.
    #[serde(skip)]
    pub entity_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub token: String,
    pub verify_ssl: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Empty means `host_monitor_<hostname>`.
    pub client_id: String,
    pub discovery_prefix: String,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattingConfig {
    pub disk_unit: String,
    pub memory_unit: String,
    pub network_unit: String,
    pub decimal_places: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl MetricSettings {
    fn new(enabled: bool, frequency: u64) -> Self {
        Self {
            enabled,
            frequency: Some(frequency),
            path: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut metrics = BTreeMap::new();
        metrics.insert("cpu_percent".to_string(), MetricSettings::new(true, 60));
        metrics.insert("cpu_count".to_string(), MetricSettings::new(true, 300));
        metrics.insert("memory_percent".to_string(), MetricSettings::new(true, 60));
        metrics.insert("memory_available".to_string(), MetricSettings::new(true, 60));
        metrics.insert("memory_info".to_string(), MetricSettings::new(false, 60));
        metrics.insert(
            "disk_usage".to_string(),
            MetricSettings {
                path: Some("/".to_string()),
                ..MetricSettings::new(true, 300)
            },
        );
        metrics.insert("network_io".to_string(), MetricSettings::new(true, 60));
        metrics.insert("load_average".to_string(), MetricSettings::new(true, 60));
        metrics.insert("uptime".to_string(), MetricSettings::new(true, 300));
        metrics.insert("boot_time".to_string(), MetricSettings::new(true, 3600));
        metrics.insert("process_count".to_string(), MetricSettings::new(true, 60));
        metrics.insert("cpu_temp".to_string(), MetricSettings::new(false, 60));

        Self {
            report_mode: ReportMode::RestApi,
            update_frequency: 60,
            host_identifier: "auto".to_string(),
            home_assistant: HomeAssistantConfig {
                url: "http://localhost:8123".to_string(),
                token: String::new(),
                verify_ssl: true,
                timeout_secs: 10,
            },
            mqtt: MqttConfig {
                broker: "localhost".to_string(),
                port: 1883,
                username: String::new(),
                password: String::new(),
                client_id: String::new(),
                discovery_prefix: "homeassistant".to_string(),
                keep_alive_secs: 60,
            },
            formatting: FormattingConfig {
                disk_unit: "GB".to_string(),
                memory_unit: "GB".to_string(),
                network_unit: "MB".to_string(),
                decimal_places: 2,
            },
            metrics,
            entity_prefix: String::new(),
        }
    }
}

impl AppConfig {
    /// Load `config.toml` from `dir`, creating a default one on first start.
    ///
    /// A file that cannot be read or parsed is reported and replaced by the
    /// defaults for this run; validation then decides whether that is fatal.
    pub async fn load(dir: &Path, error_log: &ErrorLog) -> MonitorResult<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| MonitorError::Io {
                path: dir.to_path_buf(),
                source,
            })?;

        let path = config_file_path(dir);
        let mut config = if path.exists() {
            info!(path = %path.display(), "loading configuration");
            match Self::read_merged(&path).await {
                Ok(config) => config,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "error loading config file");
                    error_log.record(format!("Config loading error: {e}"));
                    Self::default()
                }
            }
        } else {
            info!(path = %path.display(), "config file not found, creating default");
            let config = Self::default();
            if let Err(e) = config.save(&path).await {
                error!(error = %e, "error creating default config");
                error_log.record(format!("Failed to create default config: {e}"));
            }
            config
        };

        config.resolve_entity_prefix();
        Ok(config)
    }

    async fn read_merged(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&content)
    }

    /// Parse a (possibly partial) TOML document on top of the defaults.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let overlay: toml::Value = toml::from_str(content)?;
        let mut merged = toml::Value::try_from(Self::default())?;
        merge_toml(&mut merged, overlay);
        Ok(merged.try_into()?)
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        info!(path = %path.display(), "default configuration written");
        Ok(())
    }

    pub fn resolve_entity_prefix(&mut self) {
        let identifier = if self.host_identifier == "auto" {
            let hostname = detect_hostname();
            info!(hostname = %hostname, "auto-detected host identifier");
            hostname
        } else {
            self.host_identifier.clone()
        };
        self.entity_prefix = format!("{}_monitor", sanitize_identifier(&identifier));
        info!(entity_prefix = %self.entity_prefix, "using entity prefix");
    }

    pub fn validate(&self) -> MonitorResult<()> {
        match self.report_mode {
            ReportMode::RestApi => {
                if self.home_assistant.url.trim().is_empty() {
                    return Err(invalid("Missing home_assistant.url"));
                }
                if self.home_assistant.token.trim().is_empty() {
                    return Err(invalid("Missing home_assistant.token"));
                }
            }
            ReportMode::Mqtt => {
                if self.mqtt.broker.trim().is_empty() {
                    return Err(invalid("Missing mqtt.broker"));
                }
                if self.mqtt.port == 0 {
                    return Err(invalid("mqtt.port must be non-zero"));
                }
            }
        }

        if self.update_frequency < MIN_UPDATE_FREQUENCY_SECS {
            return Err(invalid(format!(
                "update_frequency must be at least {MIN_UPDATE_FREQUENCY_SECS} seconds"
            )));
        }

        for (name, settings) in &self.metrics {
            if settings.frequency == Some(0) {
                return Err(invalid(format!(
                    "metrics.{name}.frequency must be at least 1 second"
                )));
            }
        }

        for (field, unit) in [
            ("disk_unit", &self.formatting.disk_unit),
            ("memory_unit", &self.formatting.memory_unit),
            ("network_unit", &self.formatting.network_unit),
        ] {
            if unit.parse::<ByteUnit>().is_err() {
                return Err(invalid(format!(
                    "formatting.{field} must be one of B, KB, MB, GB, TB (got {unit})"
                )));
            }
        }

        if self.formatting.decimal_places > MAX_DECIMAL_PLACES {
            return Err(invalid(format!(
                "formatting.decimal_places must be at most {MAX_DECIMAL_PLACES}"
            )));
        }

        Ok(())
    }

    /// Known metrics from the configuration; unknown names are skipped.
    pub fn metric_specs(&self) -> Vec<MetricSpec> {
        self.metrics
            .iter()
            .filter_map(|(name, settings)| match name.parse::<MetricKind>() {
                Ok(kind) => Some(MetricSpec {
                    kind,
                    enabled: settings.enabled,
                    frequency: settings.frequency,
                    path: settings.path.clone(),
                }),
                Err(_) => {
                    warn!(metric = %name, "unknown metric in configuration, ignoring");
                    None
                }
            })
            .collect()
    }
}

impl MqttConfig {
    pub fn effective_client_id(&self) -> String {
        if self.client_id.trim().is_empty() {
            format!("host_monitor_{}", detect_hostname())
        } else {
            self.client_id.clone()
        }
    }
}

fn invalid(message: impl Into<String>) -> MonitorError {
    MonitorError::ConfigInvalid(message.into())
}

/// Recursively overlay `overlay` onto `base`; tables merge, everything else replaces.
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Config directory: explicit value, then the container mount, then the OS config dir.
pub fn resolve_config_dir(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir;
    }
    let container = PathBuf::from(CONTAINER_CONFIG_DIR);
    if container.exists() {
        return container;
    }
    dirs::config_dir()
        .map(|dir| dir.join("host-monitor"))
        .unwrap_or(container)
}

pub fn config_file_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE_NAME)
}

pub fn error_log_path(dir: &Path) -> PathBuf {
    dir.join(ERROR_LOG_FILE_NAME)
}

/// `HOSTNAME` (set in containers) wins over the kernel hostname.
fn detect_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().to_string())
}

/// Lowercase, map anything outside `[a-z0-9_]` to `_`, trim underscores.
pub fn sanitize_identifier(raw: &str) -> String {
    let mapped: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = mapped.trim_matches('_');
    if trimmed.is_empty() {
        "host".to_string()
    } else {
        trimmed.to_string()
    }
}
