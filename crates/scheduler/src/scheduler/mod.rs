//! Dependency-gated task scheduler with retry and recovery.
//!
//! Split into focused submodules:
//! - `core`: `TaskScheduler` handle, constructor, engine registry and accessors
//! - `execution`: task submission, abort, results and the failure policy
//! - `scheduling`: the matching pass and attempt watchers
//! - `job`: per-task retry/recovery state machine
//! - `penalty`: temporary exclusion of failing engines

mod core;
mod execution;
mod job;
pub mod metrics;
mod penalty;
mod scheduling;
mod state;
#[cfg(test)]
mod tests;

pub use self::core::{TaskHandle, TaskScheduler, ENGINE_ID_PROPERTY};
pub use metrics::SchedulerMetrics;
pub use penalty::FailurePenalty;
pub use state::{SchedulerStatus, TaskRecord, TaskState};
