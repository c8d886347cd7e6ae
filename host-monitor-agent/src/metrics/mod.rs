//! Host metrics sampling
//!
//! Provides the metric catalogue and the sampling capability used by the
//! monitor loop:
//! - `MetricKind`: the twelve metrics the agent knows how to report
//! - `MetricValue`: scalar, text or composite (sub-key -> number) readings
//! - `MetricsSource`: synchronous `sample` capability
//! - `SysinfoSource`: production implementation backed by `sysinfo`

use crate::error::{MonitorError, MonitorResult};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};
use sysinfo::{Components, Disks, Networks, System};
use tracing::{debug, error, info, warn};

/// sysinfo needs this much time between two CPU refreshes for a usable reading;
/// closer samples reuse the previous one.
const CPU_REFRESH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricKind {
    CpuPercent,
    CpuCount,
    MemoryPercent,
    MemoryAvailable,
    MemoryInfo,
    DiskUsage,
    NetworkIo,
    LoadAverage,
    Uptime,
    BootTime,
    ProcessCount,
    CpuTemp,
}

impl MetricKind {
    pub const ALL: [MetricKind; 12] = [
        MetricKind::CpuPercent,
        MetricKind::CpuCount,
        MetricKind::MemoryPercent,
        MetricKind::MemoryAvailable,
        MetricKind::MemoryInfo,
        MetricKind::DiskUsage,
        MetricKind::NetworkIo,
        MetricKind::LoadAverage,
        MetricKind::Uptime,
        MetricKind::BootTime,
        MetricKind::ProcessCount,
        MetricKind::CpuTemp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::CpuPercent => "cpu_percent",
            MetricKind::CpuCount => "cpu_count",
            MetricKind::MemoryPercent => "memory_percent",
            MetricKind::MemoryAvailable => "memory_available",
            MetricKind::MemoryInfo => "memory_info",
            MetricKind::DiskUsage => "disk_usage",
            MetricKind::NetworkIo => "network_io",
            MetricKind::LoadAverage => "load_average",
            MetricKind::Uptime => "uptime",
            MetricKind::BootTime => "boot_time",
            MetricKind::ProcessCount => "process_count",
            MetricKind::CpuTemp => "cpu_temp",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| MonitorError::ConfigInvalid(format!("unknown metric: {s}")))
    }
}

/// One configured metric, fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    pub kind: MetricKind,
    pub enabled: bool,
    /// Seconds between reports; `None` falls back to the global frequency.
    pub frequency: Option<u64>,
    /// Filesystem path for `disk_usage`.
    pub path: Option<String>,
}

impl MetricSpec {
    pub fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            enabled: true,
            frequency: None,
            path: None,
        }
    }

    pub fn disk_path(&self) -> &str {
        self.path.as_deref().unwrap_or("/")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(v) => *v as f64,
            Number::Float(v) => *v,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(v) => write!(f, "{v}"),
            Number::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<u64> for Number {
    fn from(v: u64) -> Self {
        Number::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for Number {
    fn from(v: usize) -> Self {
        Number::from(v as u64)
    }
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Number::Float(v)
    }
}

impl From<f32> for Number {
    fn from(v: f32) -> Self {
        Number::Float(f64::from(v))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(Number),
    Text(String),
    Composite(BTreeMap<String, Number>),
}

impl MetricValue {
    pub fn composite<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Number>,
        I: IntoIterator<Item = (K, V)>,
    {
        MetricValue::Composite(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// Synchronous sampling capability consumed by the monitor loop.
///
/// `Ok(None)` means the host has nothing to report for that metric (for
/// example no temperature sensors); `Err` means sampling itself failed.
pub trait MetricsSource: Send {
    fn sample(&mut self, spec: &MetricSpec) -> MonitorResult<Option<MetricValue>>;
}

/// Outcome of the startup diagnostic pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success,
    NoData,
    Error(String),
}

/// Sample every known metric once, for operator visibility only.
///
/// Configured metrics are probed with their own parameters (disk path);
/// the rest with the defaults.
pub fn probe_all(source: &mut dyn MetricsSource, configured: &[MetricSpec]) -> Vec<(MetricKind, ProbeOutcome)> {
    MetricKind::ALL
        .into_iter()
        .map(|kind| {
            let spec = configured
                .iter()
                .find(|spec| spec.kind == kind)
                .cloned()
                .unwrap_or_else(|| MetricSpec::new(kind));
            let outcome = match source.sample(&spec) {
                Ok(Some(_)) => {
                    info!(metric = %kind, "metric probe OK");
                    ProbeOutcome::Success
                }
                Ok(None) => {
                    warn!(metric = %kind, "metric probe returned no data");
                    ProbeOutcome::NoData
                }
                Err(e) => {
                    error!(metric = %kind, error = %e, "metric probe failed");
                    ProbeOutcome::Error(e.to_string())
                }
            };
            (kind, outcome)
        })
        .collect()
}

/// `sysinfo`-backed source keeping one `System` across samples so CPU usage
/// is measured between consecutive refreshes.
pub struct SysinfoSource {
    sys: System,
    last_cpu_refresh: Instant,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        Self {
            sys,
            last_cpu_refresh: Instant::now(),
        }
    }

    fn cpu_percent(&mut self) -> f32 {
        if self.last_cpu_refresh.elapsed() >= CPU_REFRESH_INTERVAL {
            self.sys.refresh_cpu_usage();
            self.last_cpu_refresh = Instant::now();
        }
        self.sys.global_cpu_info().cpu_usage()
    }

    fn cpu_count(&mut self) -> Option<MetricValue> {
        let count = self.sys.cpus().len();
        (count > 0).then(|| MetricValue::Scalar(count.into()))
    }

    fn memory(&mut self) -> Option<MemorySnapshot> {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        if total == 0 {
            return None;
        }
        let available = self.sys.available_memory();
        let used = total.saturating_sub(available);
        Some(MemorySnapshot {
            total,
            available,
            used,
            free: self.sys.free_memory(),
            percent: used as f64 / total as f64 * 100.0,
        })
    }

    fn disk_usage(&self, path: &str) -> MonitorResult<Option<MetricValue>> {
        let disks = Disks::new_with_refreshed_list();
        let target = Path::new(path);

        // Longest mount point containing the path wins, like `df <path>`.
        let disk = disks
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len());

        let Some(disk) = disk else {
            return Err(MonitorError::SampleUnavailable {
                metric: MetricKind::DiskUsage.to_string(),
                reason: format!("no filesystem mounted at {path}"),
            });
        };

        let total = disk.total_space();
        let free = disk.available_space();
        let used = total.saturating_sub(free);
        let percent = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(Some(MetricValue::composite([
            ("total", Number::from(total)),
            ("used", Number::from(used)),
            ("free", Number::from(free)),
            ("percent", Number::from(percent)),
        ])))
    }

    fn network_io(&self) -> Option<MetricValue> {
        let networks = Networks::new_with_refreshed_list();
        if networks.iter().next().is_none() {
            return None;
        }

        let mut totals = NetworkTotals::default();
        for (_name, data) in networks.iter() {
            totals.bytes_sent += data.total_transmitted();
            totals.bytes_recv += data.total_received();
            totals.packets_sent += data.total_packets_transmitted();
            totals.packets_recv += data.total_packets_received();
            totals.errin += data.total_errors_on_received();
            totals.errout += data.total_errors_on_transmitted();
        }

        Some(MetricValue::composite([
            ("bytes_sent", totals.bytes_sent),
            ("bytes_recv", totals.bytes_recv),
            ("packets_sent", totals.packets_sent),
            ("packets_recv", totals.packets_recv),
            ("errin", totals.errin),
            ("errout", totals.errout),
        ]))
    }

    fn load_average(&self) -> Option<MetricValue> {
        if !cfg!(unix) {
            return None;
        }
        let load = System::load_average();
        Some(MetricValue::composite([
            ("load_1min", load.one),
            ("load_5min", load.five),
            ("load_15min", load.fifteen),
        ]))
    }

    fn boot_time(&self) -> Option<MetricValue> {
        let boot = System::boot_time();
        let secs = i64::try_from(boot).ok()?;
        let at = DateTime::from_timestamp(secs, 0)?.with_timezone(&Local);
        Some(MetricValue::Text(at.to_rfc3339()))
    }

    fn process_count(&mut self) -> Option<MetricValue> {
        self.sys.refresh_processes();
        let count = self.sys.processes().len();
        (count > 0).then(|| MetricValue::Scalar(count.into()))
    }

    fn cpu_temp(&self) -> Option<MetricValue> {
        let components = Components::new_with_refreshed_list();
        let readings = temperature_readings(
            components
                .iter()
                .map(|component| (component.label(), component.temperature())),
        );

        if readings.is_empty() {
            warn!("no temperature sensors found");
            None
        } else {
            Some(MetricValue::Composite(readings))
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    fn sample(&mut self, spec: &MetricSpec) -> MonitorResult<Option<MetricValue>> {
        debug!(metric = %spec.kind, "sampling metric");

        let value = match spec.kind {
            MetricKind::CpuPercent => Some(MetricValue::Scalar(self.cpu_percent().into())),
            MetricKind::CpuCount => self.cpu_count(),
            MetricKind::MemoryPercent => self
                .memory()
                .map(|mem| MetricValue::Scalar(mem.percent.into())),
            MetricKind::MemoryAvailable => self
                .memory()
                .map(|mem| MetricValue::Scalar(mem.available.into())),
            MetricKind::MemoryInfo => self.memory().map(|mem| {
                MetricValue::composite([
                    ("total", Number::from(mem.total)),
                    ("available", Number::from(mem.available)),
                    ("used", Number::from(mem.used)),
                    ("free", Number::from(mem.free)),
                    ("percent", Number::from(mem.percent)),
                ])
            }),
            MetricKind::DiskUsage => return self.disk_usage(spec.disk_path()),
            MetricKind::NetworkIo => self.network_io(),
            MetricKind::LoadAverage => self.load_average(),
            MetricKind::Uptime => Some(MetricValue::Scalar(System::uptime().into())),
            MetricKind::BootTime => self.boot_time(),
            MetricKind::ProcessCount => self.process_count(),
            MetricKind::CpuTemp => self.cpu_temp(),
        };

        Ok(value)
    }
}

/// One reading per sensor, keyed by its sanitized label. Repeated labels get
/// `_2`, `_3`, ... and unlabeled sensors are called `sensor`.
fn temperature_readings<'a>(sensors: impl Iterator<Item = (&'a str, f32)>) -> BTreeMap<String, Number> {
    let mut readings = BTreeMap::new();
    for (label, temperature) in sensors {
        if !temperature.is_finite() {
            continue;
        }
        let base = match label.trim() {
            "" => "sensor".to_string(),
            label => crate::config::sanitize_identifier(label),
        };
        let mut key = base.clone();
        let mut suffix = 2;
        while readings.contains_key(&key) {
            key = format!("{base}_{suffix}");
            suffix += 1;
        }
        readings.insert(key, Number::from(temperature));
    }
    readings
}

struct MemorySnapshot {
    total: u64,
    available: u64,
    used: u64,
    free: u64,
    percent: f64,
}

#[derive(Default)]
struct NetworkTotals {
    bytes_sent: u64,
    bytes_recv: u64,
    packets_sent: u64,
    packets_recv: u64,
    errin: u64,
    errout: u64,
}
