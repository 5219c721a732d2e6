//! Per-task retry/recovery state machine.
//!
//! A [`Job`] wraps the caller's immutable [`Task`] and tracks what the
//! scheduler derives from it: the task currently scheduled (the original, a
//! cleanup run of its recovery task, or a substituted recovery task), the
//! remaining retry budget and the effective dependency.

use std::sync::Arc;

use serde_json::json;
use taskhub_core::{Dependency, EngineId, Operator, RecoveryMode, ResultHandle, Task, TaskId};

/// What the scheduler does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureAction {
    /// Back to the backlog with the same task.
    Retry,
    /// Back to the backlog running the recovery task as a cleanup step.
    Cleanup,
    /// Back to the backlog with the recovery task substituted.
    Recover,
    /// Terminal failure.
    Fail,
}

/// What the scheduler does after a successful attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuccessAction {
    /// The task succeeded; resolve its handle.
    Complete,
    /// A cleanup step finished; the primary task goes back to the backlog.
    Resume,
}

#[derive(Debug, Clone)]
enum Phase {
    Primary,
    /// Running the recovery task between retries of `primary`.
    Cleanup,
}

#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) id: TaskId,
    pub(crate) handle: ResultHandle,
    /// Task whose retry budget is being spent.
    primary: Arc<Task>,
    /// Task sent to the engine on the next attempt.
    current: Arc<Task>,
    dependency: Dependency,
    retries_left: u32,
    phase: Phase,
    recoveries: u32,
}

impl Job {
    pub(crate) fn new(id: TaskId, handle: ResultHandle, task: Arc<Task>) -> Self {
        Self {
            id,
            handle,
            dependency: task.dependency().clone(),
            retries_left: task.retries(),
            primary: task.clone(),
            current: task,
            phase: Phase::Primary,
            recoveries: 0,
        }
    }

    pub(crate) fn current(&self) -> &Arc<Task> {
        &self.current
    }

    pub(crate) fn dependency(&self) -> &Dependency {
        &self.dependency
    }

    pub(crate) fn retries_left(&self) -> u32 {
        self.retries_left
    }

    pub(crate) fn recoveries(&self) -> u32 {
        self.recoveries
    }

    pub(crate) fn is_cleanup(&self) -> bool {
        matches!(self.phase, Phase::Cleanup)
    }

    pub(crate) fn on_success(&mut self) -> SuccessAction {
        match self.phase {
            Phase::Primary => SuccessAction::Complete,
            Phase::Cleanup => {
                self.resume_primary();
                SuccessAction::Resume
            }
        }
    }

    /// Apply the failure policy. `avoid` names an engine the substituted
    /// recovery task must not run on.
    pub(crate) fn on_failure(&mut self, avoid: Option<EngineId>) -> FailureAction {
        if matches!(self.phase, Phase::Cleanup) {
            // A failed cleanup does not consume the primary's budget again.
            self.resume_primary();
            return FailureAction::Retry;
        }

        if self.retries_left > 0 {
            self.retries_left -= 1;
            if let (RecoveryMode::BeforeEachRetry, Some(recovery)) =
                (self.primary.recovery_mode(), self.primary.recovery())
            {
                self.current = recovery.clone();
                self.dependency = recovery.dependency().clone();
                self.phase = Phase::Cleanup;
                return FailureAction::Cleanup;
            }
            return FailureAction::Retry;
        }

        let Some(recovery) = self.primary.recovery().cloned() else {
            return FailureAction::Fail;
        };
        self.dependency = match avoid {
            Some(engine) => recovery.dependency().clone().combine(Dependency::constraints([(
                "engine_id",
                json!([engine.0]),
                Operator::NotIn,
            )])),
            None => recovery.dependency().clone(),
        };
        self.retries_left = recovery.retries();
        self.primary = recovery.clone();
        self.current = recovery;
        self.recoveries += 1;
        FailureAction::Recover
    }

    fn resume_primary(&mut self) {
        self.current = self.primary.clone();
        self.dependency = self.primary.dependency().clone();
        self.phase = Phase::Primary;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskhub_core::{ClientId, Properties};

    fn job(task: Task) -> Job {
        Job::new(
            TaskId(1),
            ResultHandle::new(ClientId::new(), 0),
            Arc::new(task),
        )
    }

    #[test]
    fn no_retries_no_recovery_fails_at_once() {
        let mut j = job(Task::new("raise"));
        assert_eq!(j.on_failure(None), FailureAction::Fail);
    }

    #[test]
    fn retries_then_fail() {
        let mut j = job(Task::builder("raise").retries(2).build());
        assert_eq!(j.on_failure(None), FailureAction::Retry);
        assert_eq!(j.on_failure(None), FailureAction::Retry);
        assert_eq!(j.on_failure(None), FailureAction::Fail);
    }

    #[test]
    fn recovery_substituted_after_exhaustion() {
        let recovery = Task::builder("x = 16").pull("x").retries(1).build();
        let mut j = job(Task::builder("raise").retries(1).recovery(recovery).build());

        assert_eq!(j.on_failure(None), FailureAction::Retry);
        assert_eq!(j.on_failure(None), FailureAction::Recover);
        assert_eq!(j.current().code(), "x = 16");
        assert_eq!(j.retries_left(), 1);
        assert_eq!(j.recoveries(), 1);
        assert_eq!(j.on_success(), SuccessAction::Complete);
    }

    #[test]
    fn recovery_can_avoid_failed_engine() {
        let mut j = job(Task::builder("raise").recovery(Task::new("pass")).build());
        assert_eq!(j.on_failure(Some(EngineId(4))), FailureAction::Recover);

        let on = |id: u64| -> Properties { [("engine_id".to_string(), json!(id))].into_iter().collect() };
        assert!(!j.dependency().test(&on(4)));
        assert!(j.dependency().test(&on(5)));
    }

    #[test]
    fn cleanup_runs_before_each_retry() {
        let task = Task::builder("raise")
            .retries(1)
            .recovery(Task::new("cleanup = true"))
            .recovery_mode(RecoveryMode::BeforeEachRetry)
            .build();
        let mut j = job(task);

        assert_eq!(j.on_failure(None), FailureAction::Cleanup);
        assert!(j.is_cleanup());
        assert_eq!(j.current().code(), "cleanup = true");

        assert_eq!(j.on_success(), SuccessAction::Resume);
        assert_eq!(j.current().code(), "raise");

        // Budget spent: the recovery task now replaces the original.
        assert_eq!(j.on_failure(None), FailureAction::Recover);
        assert_eq!(j.current().code(), "cleanup = true");
        assert!(!j.is_cleanup());
    }

    #[test]
    fn failed_cleanup_resumes_primary() {
        let task = Task::builder("raise")
            .retries(3)
            .recovery(Task::new("raise"))
            .recovery_mode(RecoveryMode::BeforeEachRetry)
            .build();
        let mut j = job(task);

        assert_eq!(j.on_failure(None), FailureAction::Cleanup);
        assert_eq!(j.on_failure(None), FailureAction::Retry);
        assert!(!j.is_cleanup());
        assert_eq!(j.retries_left(), 2);
    }
}
