//! Per-metric update gate

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Decides, per metric, whether enough time has passed since it last fired.
///
/// There is no drift correction: a stalled loop catches up on the next
/// check, so intervals can grow beyond the frequency but never shrink below it.
#[derive(Debug)]
pub struct Scheduler {
    default_frequency: Duration,
    frequencies: HashMap<String, Duration>,
    last_fired: HashMap<String, Instant>,
}

impl Scheduler {
    pub fn new(default_frequency_secs: u64) -> Self {
        Self {
            default_frequency: Duration::from_secs(default_frequency_secs),
            frequencies: HashMap::new(),
            last_fired: HashMap::new(),
        }
    }

    /// Override the global frequency for one metric.
    pub fn set_frequency(&mut self, metric: impl Into<String>, secs: u64) {
        self.frequencies
            .insert(metric.into(), Duration::from_secs(secs));
    }

    pub fn frequency_for(&self, metric: &str) -> Duration {
        self.frequencies
            .get(metric)
            .copied()
            .unwrap_or(self.default_frequency)
    }

    /// Returns true when `metric` is due at `now` and records `now` as its
    /// last firing; a metric never seen before is always due.
    pub fn is_due(&mut self, metric: &str, now: Instant) -> bool {
        let frequency = self.frequency_for(metric);
        let due = match self.last_fired.get(metric) {
            None => true,
            Some(last) => now.saturating_duration_since(*last) >= frequency,
        };

        if due {
            self.last_fired.insert(metric.to_string(), now);
        }
        due
    }

    pub fn tracked(&self) -> usize {
        self.last_fired.len()
    }
}
