use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduler tuning knobs. Every field has a default, so an empty TOML
/// document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Completed commands kept per engine.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Wall-clock exclusion of an engine after one of its commands fails.
    #[serde(default)]
    pub failure_penalty_ms: u64,

    /// Number of scheduling passes an engine sits out after a failure.
    #[serde(default)]
    pub failure_penalty_passes: u32,

    /// Substituted recovery tasks must not run on the engine that just failed.
    #[serde(default)]
    pub recovery_avoids_failed_engine: bool,

    /// Deepest recovery chain `run` accepts. `0` rejects every task that
    /// carries a recovery task.
    #[serde(default = "default_max_recovery_depth")]
    pub max_recovery_depth: usize,

    /// Fail `run` with `EngineUnavailable` when no engine is registered,
    /// instead of keeping the task pending.
    #[serde(default)]
    pub reject_without_engines: bool,
}

fn default_history_limit() -> usize {
    100
}

fn default_max_recovery_depth() -> usize {
    32
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            failure_penalty_ms: 0,
            failure_penalty_passes: 0,
            recovery_avoids_failed_engine: false,
            max_recovery_depth: default_max_recovery_depth(),
            reject_without_engines: false,
        }
    }
}

impl SchedulerConfig {
    pub fn failure_penalty(&self) -> Duration {
        Duration::from_millis(self.failure_penalty_ms)
    }

    /// Whether a failing engine is excluded at all.
    pub fn has_failure_penalty(&self) -> bool {
        self.failure_penalty_ms > 0 || self.failure_penalty_passes > 0
    }
}
