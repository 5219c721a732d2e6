use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use taskhub_core::{EngineId, ResultHandle, TaskId};
use taskhub_engine::{EngineQueue, EngineStatus};

use super::job::Job;
use super::penalty::PenaltyState;

/// Externally visible task state.
///
/// `FAILED_RETRY` is transient and never observed: a failed attempt moves the
/// task straight back to `Pending` or on to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    FailedFinal,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedFinal | Self::Aborted)
    }
}

/// Bookkeeping for one submitted task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub handle: ResultHandle,
    pub state: TaskState,
    /// Attempts started, including cleanup and recovery runs.
    pub attempts: u32,
    /// Engines used, one entry per attempt.
    pub engines: Vec<EngineId>,
    /// Recovery substitutions so far.
    pub recoveries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub(crate) fn new(id: TaskId, handle: ResultHandle) -> Self {
        Self {
            id,
            handle,
            state: TaskState::Pending,
            attempts: 0,
            engines: Vec::new(),
            recoveries: 0,
            last_error: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn finish(&mut self, state: TaskState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

/// Snapshot of the whole scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub tasks: BTreeMap<TaskState, usize>,
    pub engines: Vec<EngineStatus>,
    /// Engines currently sitting out a failure penalty.
    pub penalized: Vec<EngineId>,
}

impl SchedulerStatus {
    /// Number of tasks in `state`.
    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.get(&state).copied().unwrap_or(0)
    }
}

pub(crate) struct EngineSlot {
    pub(crate) queue: Arc<EngineQueue>,
    /// Task assigned by the scheduler and not yet reported back.
    pub(crate) running: Option<TaskId>,
    pub(crate) penalty: PenaltyState,
}

pub(crate) struct Running {
    pub(crate) job: Job,
    pub(crate) engine: EngineId,
    pub(crate) started: Instant,
}

/// Everything a scheduling pass reads or writes. Guarded by one mutex.
#[derive(Default)]
pub(crate) struct SchedulerState {
    pub(crate) engines: BTreeMap<EngineId, EngineSlot>,
    /// PENDING jobs keyed by id: iteration order is submission order.
    pub(crate) backlog: BTreeMap<TaskId, Job>,
    pub(crate) running: HashMap<TaskId, Running>,
    pub(crate) records: HashMap<TaskId, TaskRecord>,
    pub(crate) next_task: u64,
    pub(crate) next_engine: u64,
}

impl SchedulerState {
    /// Put `job` back into the backlog at its original submission position.
    pub(crate) fn requeue(&mut self, job: Job) {
        if let Some(record) = self.records.get_mut(&job.id) {
            record.state = TaskState::Pending;
        }
        self.backlog.insert(job.id, job);
    }
}
