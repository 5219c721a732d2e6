//! Temporary exclusion of engines whose commands just failed.

use std::time::{Duration, Instant};

use crate::config::SchedulerConfig;

/// How long a failing engine sits out: a wall-clock duration, a number of
/// scheduling passes, or both. Zero for both means no exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailurePenalty {
    pub duration: Duration,
    pub passes: u32,
}

impl FailurePenalty {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            duration: config.failure_penalty(),
            passes: config.failure_penalty_passes,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.duration.is_zero() && self.passes == 0
    }
}

/// Why an engine sat out a scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exclusion {
    /// Excluded until the given instant.
    Until(Instant),
    /// One pass of a pass-count penalty was consumed.
    Pass,
}

/// Exclusion state of one engine.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PenaltyState {
    until: Option<Instant>,
    passes_left: u32,
}

impl PenaltyState {
    pub(crate) fn apply(&mut self, penalty: FailurePenalty, now: Instant) {
        if !penalty.duration.is_zero() {
            self.until = Some(now + penalty.duration);
        }
        self.passes_left = self.passes_left.max(penalty.passes);
    }

    /// Whether the engine is excluded from the pass running at `now`.
    /// Consumes one pass of a pass-count penalty.
    pub(crate) fn excludes(&mut self, now: Instant) -> Option<Exclusion> {
        if let Some(until) = self.until {
            if now < until {
                return Some(Exclusion::Until(until));
            }
            self.until = None;
        }
        if self.passes_left > 0 {
            self.passes_left -= 1;
            return Some(Exclusion::Pass);
        }
        None
    }

    pub(crate) fn is_active(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until) || self.passes_left > 0
    }
}
