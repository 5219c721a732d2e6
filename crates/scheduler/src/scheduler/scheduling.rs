use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use taskhub_core::sync::{lock, write};
use taskhub_core::{EngineId, ResultHandle, TaskId};
use taskhub_engine::Command;

use super::core::Shared;
use super::penalty::Exclusion;
use super::state::{Running, TaskState};

impl Shared {
    /// One first-fit pass: every idle, unpenalized engine (in id order) takes
    /// the earliest-submitted pending task whose dependency its properties
    /// satisfy. Returns the number of tasks started.
    ///
    /// An engine sitting out a pass-count penalty gets a follow-up pass, so
    /// the penalty runs down without outside events.
    pub(super) fn schedule_pass(self: &Arc<Self>) -> usize {
        let now = self.clock.now();
        let mut started: Vec<(TaskId, EngineId, ResultHandle)> = Vec::new();
        let mut follow_up = false;
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            for (&engine, slot) in state.engines.iter_mut() {
                if state.backlog.is_empty() {
                    break;
                }
                if slot.running.is_some() || !slot.queue.is_connected() || !slot.queue.is_idle() {
                    continue;
                }
                if let Some(exclusion) = slot.penalty.excludes(now) {
                    trace!(engine = %engine, ?exclusion, "engine penalized, skipping");
                    follow_up |= exclusion == Exclusion::Pass;
                    continue;
                }

                let properties = slot.queue.properties();
                let Some(task) = state
                    .backlog
                    .iter()
                    .find(|(_, job)| job.dependency().test(&properties))
                    .map(|(id, _)| *id)
                else {
                    continue;
                };
                let Some(job) = state.backlog.remove(&task) else {
                    continue;
                };

                let command = match slot.queue.submit(Command::RunTask(job.current().clone())) {
                    Ok(handle) => handle,
                    Err(e) => {
                        debug!(engine = %engine, task = %task, error = %e, "engine refused task");
                        state.backlog.insert(task, job);
                        continue;
                    }
                };

                slot.running = Some(task);
                if let Some(record) = state.records.get_mut(&task) {
                    record.state = TaskState::Running;
                    record.attempts += 1;
                    record.engines.push(engine);
                }
                debug!(task = %task, engine = %engine, cleanup = job.is_cleanup(), "task assigned");
                state.running.insert(
                    task,
                    Running {
                        job,
                        engine,
                        started: now,
                    },
                );
                started.push((task, engine, command));
            }
        }

        if !started.is_empty() {
            write(&self.metrics).attempts += started.len() as u64;
        }
        for &(task, engine, command) in &started {
            self.watch(task, engine, command);
        }
        if follow_up {
            self.wake_after(Duration::ZERO);
        }
        trace!(assigned = started.len(), "scheduling pass");
        started.len()
    }

    /// Run a scheduling pass once `delay` has elapsed.
    pub(super) fn wake_after(self: &Arc<Self>, delay: Duration) {
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.schedule_pass();
            }
        });
    }

    /// Wait for an attempt's command to resolve, then feed the outcome back.
    fn watch(self: &Arc<Self>, task: TaskId, engine: EngineId, command: ResultHandle) {
        let shared = Arc::downgrade(self);
        let broker = self.broker.clone();
        let client = self.command_client;
        tokio::spawn(async move {
            let outcome = broker.fetch(client, command, true).await;
            if let Err(e) = broker.release(command) {
                trace!(handle = %command, error = %e, "command handle already gone");
            }
            if let Some(shared) = shared.upgrade() {
                shared.on_attempt_finished(task, engine, outcome);
            }
        });
    }
}
