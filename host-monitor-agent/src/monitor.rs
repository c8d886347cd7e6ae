//! Monitor loop
//!
//! Lifecycle: `Uninitialized -> Initializing -> Running -> ShuttingDown -> Stopped`.
//!
//! Every tick asks the scheduler which metrics are due, samples them, formats
//! and flattens the readings, then hands the whole batch to the reporting
//! backend in one call. Failures are contained per metric and per update; a
//! tick that fails as a whole only triggers a back-off.

use crate::config::AppConfig;
use crate::error::{ErrorLog, MonitorError, MonitorResult};
use crate::formatter::Formatter;
use crate::metrics::{probe_all, MetricKind, MetricSpec, MetricsSource, ProbeOutcome};
use crate::report::{build_backend, ReportBackend, SensorUpdate, READY_TIMEOUT};
use crate::scheduler::Scheduler;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// A failed tick waits this many tick intervals before the next one.
const ERROR_BACKOFF_FACTOR: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::Uninitialized => "uninitialized",
            MonitorState::Initializing => "initializing",
            MonitorState::Running => "running",
            MonitorState::ShuttingDown => "shutting_down",
            MonitorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sampled: usize,
    pub skipped: usize,
    pub published: usize,
    pub failed: usize,
}

pub struct Monitor {
    config: AppConfig,
    specs: Vec<MetricSpec>,
    source: Box<dyn MetricsSource>,
    formatter: Formatter,
    scheduler: Scheduler,
    backend: Option<Box<dyn ReportBackend>>,
    error_log: ErrorLog,
    running: Arc<AtomicBool>,
    state: MonitorState,
    tick_interval: Duration,
}

impl Monitor {
    pub fn new(config: AppConfig, source: Box<dyn MetricsSource>, error_log: ErrorLog) -> Self {
        let specs = config.metric_specs();
        let mut scheduler = Scheduler::new(config.update_frequency);
        for spec in &specs {
            if let Some(secs) = spec.frequency {
                scheduler.set_frequency(spec.kind.as_str(), secs);
            }
        }

        Self {
            config,
            specs,
            source,
            formatter: Formatter::default(),
            scheduler,
            backend: None,
            error_log,
            running: Arc::new(AtomicBool::new(true)),
            state: MonitorState::Uninitialized,
            tick_interval: TICK_INTERVAL,
        }
    }

    /// Use `backend` instead of building one from `report_mode`.
    pub fn with_backend(mut self, backend: Box<dyn ReportBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Shared run flag; storing `false` stops the loop after the current tick.
    pub fn run_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    fn transition(&mut self, next: MonitorState) {
        info!(from = %self.state, to = %next, "monitor state change");
        self.state = next;
    }

    /// Validate configuration, bring up the backend and run the diagnostic
    /// pass. Any error here is fatal and has already been error-logged.
    pub async fn initialize(&mut self) -> MonitorResult<()> {
        self.transition(MonitorState::Initializing);

        if let Err(e) = self.prepare().await {
            error!(error = %e, "initialization failed");
            self.error_log.record(format!("Initialization failed: {e}"));
            return Err(e);
        }

        self.run_diagnostics();
        self.transition(MonitorState::Running);
        Ok(())
    }

    async fn prepare(&mut self) -> MonitorResult<()> {
        self.config.validate()?;
        self.formatter = Formatter::from_config(&self.config.formatting)?;

        if self.backend.is_none() {
            self.backend = Some(build_backend(&self.config)?);
        }
        let backend = self.backend_mut()?;
        info!(backend = backend.name(), "testing connection");

        let (ok, reason) = backend.test_connection().await;
        if !ok {
            return Err(MonitorError::ConnectivityFailure(
                reason.unwrap_or_else(|| "connection test failed".to_string()),
            ));
        }
        backend.connect().await?;
        if !backend.wait_ready(READY_TIMEOUT).await {
            warn!(timeout = ?READY_TIMEOUT, "backend not ready yet, early reports may fail");
        }

        let enabled = self.specs.iter().filter(|spec| spec.enabled).count();
        info!(
            enabled,
            update_frequency = self.config.update_frequency,
            entity_prefix = %self.config.entity_prefix,
            "monitor initialized"
        );
        Ok(())
    }

    fn backend_mut(&mut self) -> MonitorResult<&mut Box<dyn ReportBackend>> {
        self.backend
            .as_mut()
            .ok_or_else(|| MonitorError::ConnectivityFailure("reporting backend not initialized".to_string()))
    }

    /// Sample every known metric once. Results are informational only.
    pub fn run_diagnostics(&mut self) -> Vec<(MetricKind, ProbeOutcome)> {
        info!("running metric diagnostics");
        let outcomes = probe_all(self.source.as_mut(), &self.specs);

        for (kind, outcome) in &outcomes {
            match outcome {
                ProbeOutcome::Success => {}
                ProbeOutcome::NoData => self
                    .error_log
                    .record(format!("Diagnostic: metric {kind} returned no data")),
                ProbeOutcome::Error(reason) => self
                    .error_log
                    .record(format!("Diagnostic: metric {kind} failed: {reason}")),
            }
        }

        let working = outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == ProbeOutcome::Success)
            .count();
        info!(working, total = outcomes.len(), "diagnostics complete");
        outcomes
    }

    /// One pass over all enabled metrics at `now`.
    pub async fn tick(&mut self, now: Instant) -> MonitorResult<TickReport> {
        let mut report = TickReport::default();
        let mut updates: Vec<SensorUpdate> = Vec::new();

        for spec in self.specs.iter().filter(|spec| spec.enabled) {
            let name = spec.kind.as_str();
            if !self.scheduler.is_due(name, now) {
                continue;
            }

            let value = match self.source.sample(spec) {
                Ok(Some(value)) => value,
                Ok(None) => {
                    warn!(metric = name, "no data for metric, skipping");
                    self.error_log.record(format!("No data for metric {name}"));
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(metric = name, error = %e, "failed to sample metric");
                    self.error_log.record(format!("Error collecting {name}: {e}"));
                    report.skipped += 1;
                    continue;
                }
            };

            match self.formatter.format(spec.kind, value) {
                Ok(formatted) => {
                    report.sampled += 1;
                    updates.extend(self.formatter.flatten(spec.kind, formatted));
                }
                Err(e) => {
                    error!(metric = name, error = %e, "failed to format metric");
                    self.error_log.record(format!("Error formatting {name}: {e}"));
                    report.skipped += 1;
                }
            }
        }

        if updates.is_empty() {
            return Ok(report);
        }

        let backend = self.backend_mut()?;
        debug!(count = updates.len(), backend = backend.name(), "publishing updates");
        let results = backend.publish(&updates).await?;

        for (identifier, result) in results {
            if result.success {
                report.published += 1;
                continue;
            }
            let failure = MonitorError::PublishFailure {
                identifier,
                reason: result.error.unwrap_or_else(|| "unknown error".to_string()),
            };
            warn!(error = %failure, "update failed");
            self.error_log.record(failure.to_string());
            report.failed += 1;
        }

        Ok(report)
    }

    /// Tick until the run flag is cleared.
    pub async fn run(&mut self) {
        info!(tick = ?self.tick_interval, "monitor loop started");

        while self.running.load(Ordering::Acquire) {
            let now = tokio::time::Instant::now().into_std();
            let pause = match self.tick(now).await {
                Ok(report) => {
                    if report != TickReport::default() {
                        debug!(?report, "tick complete");
                    }
                    self.tick_interval
                }
                Err(e) => {
                    error!(error = %e, "error in monitoring loop");
                    self.error_log.record(format!("Monitoring loop error: {e}"));
                    self.tick_interval * ERROR_BACKOFF_FACTOR
                }
            };
            tokio::time::sleep(pause).await;
        }

        self.transition(MonitorState::ShuttingDown);
    }

    /// Close the backend, whatever state initialization reached.
    pub async fn shutdown(&mut self) {
        if self.state != MonitorState::ShuttingDown {
            self.transition(MonitorState::ShuttingDown);
        }
        if let Some(backend) = self.backend.as_mut() {
            backend.close().await;
        }
        self.transition(MonitorState::Stopped);
        info!("monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricSettings;
    use crate::metrics::{MetricValue, Number};
    use crate::report::{ReportResult, ReportResults};
    use async_trait::async_trait;
    use host_monitor_devkit::init_test_logging;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::Mutex;

    struct FakeSource {
        values: HashMap<MetricKind, MetricValue>,
        failing: HashSet<MetricKind>,
        seen: Arc<Mutex<Vec<MetricSpec>>>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                values: HashMap::new(),
                failing: HashSet::new(),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn with(mut self, kind: MetricKind, value: MetricValue) -> Self {
            self.values.insert(kind, value);
            self
        }
    }

    impl MetricsSource for FakeSource {
        fn sample(&mut self, spec: &MetricSpec) -> MonitorResult<Option<MetricValue>> {
            self.seen.lock().unwrap().push(spec.clone());
            if self.failing.contains(&spec.kind) {
                return Err(MonitorError::SampleUnavailable {
                    metric: spec.kind.to_string(),
                    reason: "simulated".to_string(),
                });
            }
            Ok(self.values.get(&spec.kind).cloned())
        }
    }

    #[derive(Default)]
    struct BackendLog {
        batches: Vec<Vec<SensorUpdate>>,
        publish_times: Vec<tokio::time::Instant>,
        connected: bool,
        ready_wait: Option<Duration>,
        closed: bool,
    }

    struct RecordingBackend {
        log: Arc<Mutex<BackendLog>>,
        reachable: bool,
        publish_error: bool,
        failing_keys: HashSet<String>,
        stop_after: Option<(usize, Arc<AtomicBool>)>,
        /// Reject publishes until `wait_ready` ran, like a broker without ConnAck.
        needs_handshake: bool,
    }

    impl RecordingBackend {
        fn new() -> (Self, Arc<Mutex<BackendLog>>) {
            let log = Arc::new(Mutex::new(BackendLog::default()));
            let backend = Self {
                log: Arc::clone(&log),
                reachable: true,
                publish_error: false,
                failing_keys: HashSet::new(),
                stop_after: None,
                needs_handshake: false,
            };
            (backend, log)
        }
    }

    #[async_trait]
    impl ReportBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn connect(&mut self) -> MonitorResult<()> {
            self.log.lock().unwrap().connected = true;
            Ok(())
        }

        async fn wait_ready(&mut self, timeout: Duration) -> bool {
            self.log.lock().unwrap().ready_wait = Some(timeout);
            true
        }

        async fn publish(&mut self, updates: &[SensorUpdate]) -> MonitorResult<ReportResults> {
            let (calls, ready) = {
                let mut log = self.log.lock().unwrap();
                log.batches.push(updates.to_vec());
                log.publish_times.push(tokio::time::Instant::now());
                (log.batches.len(), log.ready_wait.is_some())
            };
            if let Some((limit, flag)) = &self.stop_after {
                if calls >= *limit {
                    flag.store(false, Ordering::Release);
                }
            }
            if self.publish_error {
                return Err(MonitorError::ConnectivityFailure("hub gone".to_string()));
            }

            Ok(updates
                .iter()
                .map(|update| {
                    let result = if self.needs_handshake && !ready {
                        ReportResult::failed("not connected")
                    } else if self.failing_keys.contains(&update.key) {
                        ReportResult::failed("HTTP 500: boom")
                    } else {
                        ReportResult::ok()
                    };
                    (update.key.clone(), result)
                })
                .collect())
        }

        async fn test_connection(&mut self) -> (bool, Option<String>) {
            if self.reachable {
                (true, None)
            } else {
                (false, Some("hub unreachable".to_string()))
            }
        }

        async fn close(&mut self) {
            self.log.lock().unwrap().closed = true;
        }
    }

    fn config(metrics: &[(&str, u64)]) -> AppConfig {
        let mut config = AppConfig::default();
        config.home_assistant.token = "secret".to_string();
        config.entity_prefix = "test_monitor".to_string();
        config.metrics = metrics
            .iter()
            .map(|(name, frequency)| {
                let settings = MetricSettings {
                    enabled: true,
                    frequency: Some(*frequency),
                    path: None,
                };
                (name.to_string(), settings)
            })
            .collect::<BTreeMap<_, _>>();
        config
    }

    fn error_lines(log: &ErrorLog) -> Vec<String> {
        std::fs::read_to_string(log.path())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn keys(batch: &[SensorUpdate]) -> Vec<&str> {
        batch.iter().map(|update| update.key.as_str()).collect()
    }

    #[tokio::test]
    async fn test_absent_metric_is_skipped_and_others_published() {
        let dir = tempfile::tempdir().unwrap();
        let error_log = ErrorLog::new(dir.path().join("error.log"));
        let source = FakeSource::new().with(MetricKind::CpuPercent, MetricValue::Scalar(Number::Float(12.346)));
        let (backend, log) = RecordingBackend::new();

        let mut monitor = Monitor::new(config(&[("cpu_percent", 60), ("uptime", 60)]), Box::new(source), error_log.clone())
            .with_backend(Box::new(backend));
        let report = monitor.tick(Instant::now()).await.unwrap();

        assert_eq!(report.sampled, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.published, 1);

        let log = log.lock().unwrap();
        assert_eq!(log.batches.len(), 1);
        assert_eq!(keys(&log.batches[0]), vec!["cpu_percent"]);
        assert_eq!(log.batches[0][0].state.to_string(), "12.35");

        let lines = error_lines(&error_log);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("No data for metric uptime"));
    }

    #[tokio::test]
    async fn test_metrics_fire_on_their_own_frequency() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new()
            .with(MetricKind::CpuPercent, MetricValue::Scalar(Number::Float(5.0)))
            .with(MetricKind::Uptime, MetricValue::Scalar(Number::Int(100)));
        let (backend, log) = RecordingBackend::new();
        let mut monitor = Monitor::new(
            config(&[("cpu_percent", 60), ("uptime", 5)]),
            Box::new(source),
            ErrorLog::new(dir.path().join("error.log")),
        )
        .with_backend(Box::new(backend));

        let t0 = Instant::now();
        monitor.tick(t0).await.unwrap();
        monitor.tick(t0 + Duration::from_secs(1)).await.unwrap();
        monitor.tick(t0 + Duration::from_secs(10)).await.unwrap();
        monitor.tick(t0 + Duration::from_secs(61)).await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.batches.len(), 3);
        assert_eq!(keys(&log.batches[0]), vec!["cpu_percent", "uptime"]);
        assert_eq!(keys(&log.batches[1]), vec!["uptime"]);
        assert_eq!(keys(&log.batches[2]), vec!["cpu_percent", "uptime"]);
    }

    #[tokio::test]
    async fn test_composite_metric_is_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new().with(
            MetricKind::LoadAverage,
            MetricValue::composite([("load_1min", 0.123), ("load_5min", 0.5), ("load_15min", 1.0)]),
        );
        let (backend, log) = RecordingBackend::new();
        let mut monitor = Monitor::new(
            config(&[("load_average", 60)]),
            Box::new(source),
            ErrorLog::new(dir.path().join("error.log")),
        )
        .with_backend(Box::new(backend));

        let report = monitor.tick(Instant::now()).await.unwrap();
        assert_eq!(report.published, 3);

        let log = log.lock().unwrap();
        let mut published = keys(&log.batches[0]);
        published.sort_unstable();
        assert_eq!(
            published,
            vec![
                "load_average_load_15min",
                "load_average_load_1min",
                "load_average_load_5min"
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_updates_are_error_logged() {
        let dir = tempfile::tempdir().unwrap();
        let error_log = ErrorLog::new(dir.path().join("error.log"));
        let mut source = FakeSource::new()
            .with(MetricKind::CpuPercent, MetricValue::Scalar(Number::Float(5.0)))
            .with(MetricKind::MemoryPercent, MetricValue::Scalar(Number::Float(40.0)));
        source.failing.insert(MetricKind::ProcessCount);
        let (mut backend, _log) = RecordingBackend::new();
        backend.failing_keys.insert("memory_percent".to_string());

        let mut monitor = Monitor::new(
            config(&[("cpu_percent", 60), ("memory_percent", 60), ("process_count", 60)]),
            Box::new(source),
            error_log.clone(),
        )
        .with_backend(Box::new(backend));

        let report = monitor.tick(Instant::now()).await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);

        let lines = error_lines(&error_log);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().any(|l| l.contains("Error collecting process_count")));
        assert!(lines
            .iter()
            .any(|l| l.contains("failed to publish memory_percent: HTTP 500: boom")));
    }

    #[tokio::test]
    async fn test_disabled_metrics_are_never_sampled() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new().with(MetricKind::CpuPercent, MetricValue::Scalar(Number::Float(5.0)));
        let (backend, log) = RecordingBackend::new();
        let mut cfg = config(&[("cpu_percent", 60)]);
        if let Some(settings) = cfg.metrics.get_mut("cpu_percent") {
            settings.enabled = false;
        }

        let mut monitor = Monitor::new(cfg, Box::new(source), ErrorLog::new(dir.path().join("error.log")))
            .with_backend(Box::new(backend));
        assert_eq!(monitor.tick(Instant::now()).await.unwrap(), TickReport::default());
        assert!(log.lock().unwrap().batches.is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_closes_backend() {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let (backend, log) = RecordingBackend::new();
        let mut monitor = Monitor::new(
            config(&[("cpu_percent", 60)]),
            Box::new(FakeSource::new()),
            ErrorLog::new(dir.path().join("error.log")),
        )
        .with_backend(Box::new(backend));

        assert_eq!(monitor.state(), MonitorState::Uninitialized);
        monitor.initialize().await.unwrap();
        assert_eq!(monitor.state(), MonitorState::Running);
        assert!(log.lock().unwrap().connected);

        monitor.run_flag().store(false, Ordering::Release);
        monitor.run().await;
        assert_eq!(monitor.state(), MonitorState::ShuttingDown);

        monitor.shutdown().await;
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(log.lock().unwrap().closed);
    }

    #[tokio::test]
    async fn test_invalid_config_aborts_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let error_log = ErrorLog::new(dir.path().join("error.log"));
        let mut cfg = config(&[("cpu_percent", 60)]);
        cfg.home_assistant.token = String::new();

        let mut monitor = Monitor::new(cfg, Box::new(FakeSource::new()), error_log.clone());
        let err = monitor.initialize().await.unwrap_err();
        assert!(matches!(err, MonitorError::ConfigInvalid(_)));
        assert_eq!(monitor.state(), MonitorState::Initializing);

        let lines = error_lines(&error_log);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Missing home_assistant.token"));

        monitor.shutdown().await;
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test]
    async fn test_unreachable_hub_aborts_but_still_closes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut backend, log) = RecordingBackend::new();
        backend.reachable = false;
        let mut monitor = Monitor::new(
            config(&[("cpu_percent", 60)]),
            Box::new(FakeSource::new()),
            ErrorLog::new(dir.path().join("error.log")),
        )
        .with_backend(Box::new(backend));

        let err = monitor.initialize().await.unwrap_err();
        assert!(matches!(err, MonitorError::ConnectivityFailure(ref reason) if reason == "hub unreachable"));
        assert!(!log.lock().unwrap().connected);

        monitor.shutdown().await;
        assert!(log.lock().unwrap().closed);
    }

    #[tokio::test]
    async fn test_diagnostics_error_log_missing_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let error_log = ErrorLog::new(dir.path().join("error.log"));
        let mut source = FakeSource::new();
        for kind in MetricKind::ALL {
            source.values.insert(kind, MetricValue::Scalar(Number::Int(1)));
        }
        source.values.remove(&MetricKind::CpuTemp);
        source.failing.insert(MetricKind::BootTime);

        let mut monitor = Monitor::new(config(&[]), Box::new(source), error_log.clone());
        let outcomes = monitor.run_diagnostics();

        assert_eq!(outcomes.len(), MetricKind::ALL.len());
        let successes = outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == ProbeOutcome::Success)
            .count();
        assert_eq!(successes, MetricKind::ALL.len() - 2);
        assert_eq!(error_lines(&error_log).len(), 2);
    }

    #[tokio::test]
    async fn test_first_tick_after_initialize_reaches_a_ready_backend() {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new().with(
            MetricKind::BootTime,
            MetricValue::Text("2024-01-01T00:00:00+00:00".to_string()),
        );
        let (mut backend, log) = RecordingBackend::new();
        backend.needs_handshake = true;

        let mut monitor = Monitor::new(
            config(&[("boot_time", 3600)]),
            Box::new(source),
            ErrorLog::new(dir.path().join("error.log")),
        )
        .with_backend(Box::new(backend));
        monitor.initialize().await.unwrap();
        assert_eq!(log.lock().unwrap().ready_wait, Some(READY_TIMEOUT));

        let report = monitor.tick(Instant::now()).await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_diagnostics_use_configured_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new();
        let seen = Arc::clone(&source.seen);
        let mut cfg = config(&[("disk_usage", 300)]);
        if let Some(settings) = cfg.metrics.get_mut("disk_usage") {
            settings.path = Some("/data".to_string());
        }

        let mut monitor = Monitor::new(cfg, Box::new(source), ErrorLog::new(dir.path().join("error.log")));
        monitor.run_diagnostics();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), MetricKind::ALL.len());
        let disk = seen.iter().find(|spec| spec.kind == MetricKind::DiskUsage).unwrap();
        assert_eq!(disk.disk_path(), "/data");
        let uptime = seen.iter().find(|spec| spec.kind == MetricKind::Uptime).unwrap();
        assert_eq!(uptime, &MetricSpec::new(MetricKind::Uptime));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new().with(MetricKind::Uptime, MetricValue::Scalar(Number::Int(100)));
        let (mut backend, log) = RecordingBackend::new();
        backend.publish_error = true;

        let mut monitor = Monitor::new(
            config(&[("uptime", 1)]),
            Box::new(source),
            ErrorLog::new(dir.path().join("error.log")),
        );
        backend.stop_after = Some((3, monitor.run_flag()));
        let mut monitor = monitor.with_backend(Box::new(backend));

        monitor.run().await;

        let log = log.lock().unwrap();
        assert_eq!(log.publish_times.len(), 3);
        for pair in log.publish_times.windows(2) {
            assert!(pair[1] - pair[0] >= TICK_INTERVAL * ERROR_BACKOFF_FACTOR);
        }
    }
}
