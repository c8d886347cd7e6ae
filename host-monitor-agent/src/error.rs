//! Error taxonomy and the durable error log
//!
//! Startup errors (`ConfigInvalid`, `ConnectivityFailure`) abort the agent.
//! Everything else is caught at the narrowest scope (per metric, per update)
//! and only logged.

use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("connectivity failure: {0}")]
    ConnectivityFailure(String),

    #[error("metric {metric} unavailable: {reason}")]
    SampleUnavailable { metric: String, reason: String },

    #[error("invalid unit: {0}")]
    InvalidUnit(String),

    #[error("cannot format {metric}: {reason}")]
    FormatError { metric: String, reason: String },

    #[error("failed to publish {identifier}: {reason}")]
    PublishFailure { identifier: String, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type MonitorResult<T> = std::result::Result<T, MonitorError>;

/// Append-only diagnostic log kept next to the configuration file.
///
/// Every line is `[<timestamp>] <message>`. Write failures are reported
/// through tracing and otherwise swallowed: the error log must never take
/// the agent down.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, message: impl AsRef<str>) {
        let line = format!("[{}] {}\n", Local::now().to_rfc3339(), message.as_ref());
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));

        if let Err(e) = result {
            error!(path = %self.path.display(), error = %e, "failed to write error log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_log_appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(dir.path().join("error.log"));

        log.record("first failure");
        log.record("second failure");

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] first failure"));
        assert!(lines[1].ends_with("] second failure"));
    }

    #[test]
    fn test_error_log_survives_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(dir.path().join("missing").join("error.log"));
        log.record("dropped");
        assert!(!log.path().exists());
    }

    #[test]
    fn test_error_messages() {
        let err = MonitorError::SampleUnavailable {
            metric: "cpu_temp".to_string(),
            reason: "no sensors".to_string(),
        };
        assert_eq!(err.to_string(), "metric cpu_temp unavailable: no sensors");
        assert_eq!(
            MonitorError::InvalidUnit("XX".to_string()).to_string(),
            "invalid unit: XX"
        );
    }
}
