use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use taskhub_core::sync::{lock, write};
use taskhub_core::{ClientId, EngineId, KernelError, Reply, ResultHandle, Task, TaskId};

use super::core::{Shared, TaskHandle, TaskScheduler};
use super::job::{FailureAction, Job, SuccessAction};
use super::state::{SchedulerStatus, TaskRecord, TaskState};

impl TaskScheduler {
    // ── Submission ──────────────────────────────────────────────────

    /// Submit `task` on behalf of the default client. Returns immediately;
    /// the outcome is resolved into the returned handle.
    pub fn run(&self, task: Task) -> Result<TaskHandle, KernelError> {
        self.inner.submit(self.inner.default_client, task)
    }

    /// Submit `task` with its result handle in `client`'s namespace.
    pub fn run_as(&self, client: ClientId, task: Task) -> Result<TaskHandle, KernelError> {
        self.inner.submit(client, task)
    }

    /// Remove a `PENDING` task from the backlog and resolve its handle as aborted.
    ///
    /// Fails with `TaskAlreadyRunning` once an attempt is in flight and with
    /// `TaskNotFound` for unknown or finished tasks.
    #[instrument(skip(self))]
    pub fn abort(&self, task: TaskId) -> Result<(), KernelError> {
        let handle = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;
            match state.backlog.remove(&task) {
                Some(job) => {
                    if let Some(record) = state.records.get_mut(&task) {
                        record.finish(TaskState::Aborted);
                    }
                    job.handle
                }
                None if state.running.contains_key(&task) => {
                    return Err(KernelError::TaskAlreadyRunning(task))
                }
                None => return Err(KernelError::TaskNotFound(task)),
            }
        };
        write(&self.inner.metrics).aborted += 1;
        info!(task = %task, "task aborted");
        self.inner.publish(handle, Err(KernelError::Aborted(task)));
        Ok(())
    }

    /// Force a scheduling pass. Returns the number of tasks started.
    pub fn spin(&self) -> usize {
        self.inner.schedule_pass()
    }

    // ── Results ─────────────────────────────────────────────────────

    /// Outcome of a task submitted through [`run`](Self::run).
    ///
    /// With `block = false` an unfinished task yields `NotCompleted`.
    pub async fn get_task_result(
        &self,
        handle: impl Into<ResultHandle>,
        block: bool,
    ) -> Result<Reply, KernelError> {
        self.inner
            .broker
            .fetch(self.inner.default_client, handle.into(), block)
            .await
    }

    /// Outcome of a task submitted through [`run_as`](Self::run_as).
    pub async fn get_task_result_as(
        &self,
        client: ClientId,
        handle: impl Into<ResultHandle>,
        block: bool,
    ) -> Result<Reply, KernelError> {
        self.inner.broker.fetch(client, handle.into(), block).await
    }

    /// Wait until every handle is resolved, successfully or not.
    pub async fn barrier<I>(&self, handles: I) -> Result<(), KernelError>
    where
        I: IntoIterator,
        I::Item: Into<ResultHandle>,
    {
        let handles: Vec<ResultHandle> = handles.into_iter().map(Into::into).collect();
        for handle in handles {
            self.inner.broker.wait(handle).await?;
        }
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn task_status(&self, task: TaskId) -> Option<TaskRecord> {
        lock(&self.inner.state).records.get(&task).cloned()
    }

    pub fn status(&self) -> SchedulerStatus {
        let now = self.inner.clock.now();
        let state = lock(&self.inner.state);
        let mut tasks = BTreeMap::new();
        for record in state.records.values() {
            *tasks.entry(record.state).or_insert(0) += 1;
        }
        SchedulerStatus {
            tasks,
            engines: state.engines.values().map(|slot| slot.queue.status()).collect(),
            penalized: state
                .engines
                .iter()
                .filter(|(_, slot)| slot.penalty.is_active(now))
                .map(|(id, _)| *id)
                .collect(),
        }
    }

    /// `DependencyUnsatisfiable` when `task` is pending and no registered
    /// engine currently satisfies its dependency. Informational: the task
    /// stays pending either way.
    pub fn check_satisfiable(&self, task: TaskId) -> Result<(), KernelError> {
        let state = lock(&self.inner.state);
        let Some(job) = state.backlog.get(&task) else {
            return if state.records.contains_key(&task) {
                Ok(())
            } else {
                Err(KernelError::TaskNotFound(task))
            };
        };
        let satisfiable = state.engines.values().any(|slot| {
            slot.queue.is_connected() && job.dependency().test(&slot.queue.properties())
        });
        if satisfiable {
            Ok(())
        } else {
            Err(KernelError::DependencyUnsatisfiable(task))
        }
    }
}

impl Shared {
    pub(super) fn submit(
        self: &Arc<Self>,
        client: ClientId,
        task: Task,
    ) -> Result<TaskHandle, KernelError> {
        let depth = task.recovery_depth();
        if depth > self.config.max_recovery_depth {
            return Err(KernelError::InvalidTask(format!(
                "recovery chain depth {depth} exceeds the limit of {}",
                self.config.max_recovery_depth
            )));
        }

        let handle = {
            let mut state = lock(&self.state);
            if self.config.reject_without_engines && state.engines.is_empty() {
                return Err(KernelError::EngineUnavailable(
                    "no engines registered".into(),
                ));
            }
            let result = self.broker.new_handle(client)?;
            let id = TaskId(state.next_task);
            state.next_task += 1;
            state.records.insert(id, TaskRecord::new(id, result));
            state.backlog.insert(id, Job::new(id, result, Arc::new(task)));
            TaskHandle { task: id, result }
        };

        write(&self.metrics).submitted += 1;
        debug!(task = %handle.task, handle = %handle.result, "task submitted");
        self.schedule_pass();
        Ok(handle)
    }

    /// Apply the outcome of one attempt: complete the task, or run the
    /// failure policy. Frees the engine and triggers a pass.
    #[instrument(skip(self, outcome), fields(ok = outcome.is_ok()))]
    pub(super) fn on_attempt_finished(
        self: &Arc<Self>,
        task: TaskId,
        engine: EngineId,
        outcome: Result<Reply, KernelError>,
    ) {
        let now = self.clock.now();
        let resolution = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;

            if let Some(slot) = state.engines.get_mut(&engine) {
                if slot.running == Some(task) {
                    slot.running = None;
                }
                if outcome.is_err() && !self.penalty.is_zero() {
                    slot.penalty.apply(self.penalty, now);
                    if !self.penalty.duration.is_zero() {
                        // Nothing else may happen before the penalty runs out.
                        self.wake_after(self.penalty.duration);
                    }
                }
            }

            let Some(running) = state.running.remove(&task) else {
                warn!(task = %task, "attempt finished for a task that is not running");
                return;
            };
            let mut job = running.job;
            let mut metrics = write(&self.metrics);
            metrics.record_attempt(
                engine,
                now.saturating_duration_since(running.started),
                outcome.is_ok(),
            );

            match outcome {
                Ok(reply) => match job.on_success() {
                    SuccessAction::Complete => {
                        if let Some(record) = state.records.get_mut(&task) {
                            record.finish(TaskState::Succeeded);
                        }
                        metrics.succeeded += 1;
                        info!(task = %task, engine = %engine, "task succeeded");
                        Some((job.handle, Ok(reply)))
                    }
                    SuccessAction::Resume => {
                        debug!(task = %task, "cleanup finished, resuming task");
                        state.requeue(job);
                        None
                    }
                },
                Err(err) => {
                    let was_cleanup = job.is_cleanup();
                    let avoid = self.config.recovery_avoids_failed_engine.then_some(engine);
                    let action = job.on_failure(avoid);
                    if let Some(record) = state.records.get_mut(&task) {
                        record.last_error = Some(err.to_string());
                        record.recoveries = job.recoveries();
                    }

                    match action {
                        FailureAction::Retry => {
                            if !was_cleanup {
                                metrics.retries += 1;
                            }
                            warn!(task = %task, engine = %engine, error = %err,
                                retries_left = job.retries_left(), "attempt failed, retrying");
                            state.requeue(job);
                            None
                        }
                        FailureAction::Cleanup => {
                            metrics.retries += 1;
                            metrics.recoveries += 1;
                            warn!(task = %task, engine = %engine, error = %err,
                                "attempt failed, running recovery before retry");
                            state.requeue(job);
                            None
                        }
                        FailureAction::Recover => {
                            metrics.recoveries += 1;
                            warn!(task = %task, engine = %engine, error = %err,
                                "retries exhausted, substituting recovery task");
                            state.requeue(job);
                            None
                        }
                        FailureAction::Fail => {
                            if let Some(record) = state.records.get_mut(&task) {
                                record.finish(TaskState::FailedFinal);
                            }
                            metrics.failed += 1;
                            warn!(task = %task, engine = %engine, error = %err, "task failed");
                            Some((job.handle, Err(err)))
                        }
                    }
                }
            }
        };

        if let Some((handle, outcome)) = resolution {
            self.publish(handle, outcome);
        }
        self.schedule_pass();
    }

    pub(super) fn publish(&self, handle: ResultHandle, outcome: Result<Reply, KernelError>) {
        if let Err(e) = self.broker.resolve(handle, outcome) {
            // The client was unregistered while the task was in the system.
            debug!(handle = %handle, error = %e, "task outcome discarded");
        }
    }
}
