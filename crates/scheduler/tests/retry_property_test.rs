//! A task with `retries = N` makes at most N + 1 attempts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;

use taskhub_core::{Execution, Namespace, Properties, RemoteFailure, Task};
use taskhub_engine::{Worker, WorkerError};
use taskhub_scheduler::{SchedulerConfig, TaskScheduler, TaskState};

struct Countdown {
    executions: AtomicUsize,
    fail_first: usize,
}

#[async_trait]
impl Worker for Countdown {
    async fn execute(&self, _code: &str) -> Result<Execution, WorkerError> {
        let n = self.executions.fetch_add(1, Ordering::SeqCst);
        let error = (n < self.fail_first).then(|| RemoteFailure::new("RuntimeError", "not yet"));
        Ok(Execution {
            error,
            ..Default::default()
        })
    }

    async fn push(&self, _namespace: &Namespace) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn pull(&self, _names: &[String]) -> Result<Namespace, WorkerError> {
        Ok(Namespace::new())
    }

    async fn reset(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "countdown"
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn attempts_bounded_by_retry_budget(retries in 0u32..5, fail_first in 0usize..8, engines in 1usize..4) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let (executions, succeeded, state, attempts) = rt.block_on(async {
            let scheduler = TaskScheduler::new(SchedulerConfig::default());
            let worker = Arc::new(Countdown {
                executions: AtomicUsize::new(0),
                fail_first,
            });
            for _ in 0..engines {
                scheduler.register(worker.clone(), Properties::new());
            }

            let handle = scheduler.run(Task::builder("go").retries(retries).build()).unwrap();
            let outcome = scheduler.get_task_result(handle, true).await;
            let record = scheduler.task_status(handle.task).unwrap();
            (worker.executions.load(Ordering::SeqCst), outcome.is_ok(), record.state, record.attempts)
        });

        let expected = fail_first.min(retries as usize) + 1;
        prop_assert_eq!(executions, expected);
        prop_assert_eq!(attempts as usize, expected);
        prop_assert_eq!(succeeded, fail_first <= retries as usize);
        let expected_state = if succeeded { TaskState::Succeeded } else { TaskState::FailedFinal };
        prop_assert_eq!(state, expected_state);
    }
}
