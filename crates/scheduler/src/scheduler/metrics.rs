use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use taskhub_core::EngineId;

/// Scheduler operational counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Tasks accepted by `run`.
    pub submitted: u64,
    pub succeeded: u64,
    /// Tasks that ended `FAILED_FINAL`.
    pub failed: u64,
    pub aborted: u64,
    /// Execution attempts started, including retries and recovery runs.
    pub attempts: u64,
    pub failed_attempts: u64,
    pub retries: u64,
    /// Recovery tasks run, either substituted or as cleanup steps.
    pub recoveries: u64,
    /// Attempts finished per engine.
    pub executions_by_engine: BTreeMap<EngineId, u64>,
    /// Rolling mean of attempt duration.
    pub avg_attempt_duration: Duration,
    pub last_completion: Option<DateTime<Utc>>,
}

impl SchedulerMetrics {
    /// Record a finished attempt.
    pub fn record_attempt(&mut self, engine: EngineId, duration: Duration, succeeded: bool) {
        *self.executions_by_engine.entry(engine).or_default() += 1;
        if !succeeded {
            self.failed_attempts += 1;
        }
        self.last_completion = Some(Utc::now());

        let count: u64 = self.executions_by_engine.values().sum();
        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.avg_attempt_duration = if count == 1 {
            duration
        } else {
            let prev = self.avg_attempt_duration.as_nanos() as f64;
            let cur = duration.as_nanos() as f64;
            Duration::from_nanos((prev + (cur - prev) / count as f64) as u64)
        };
    }

    /// Tasks submitted but not yet terminal.
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.succeeded + self.failed + self.aborted)
    }
}
