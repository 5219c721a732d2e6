use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use taskhub_core::sync::lock;
use taskhub_core::{
    Dependency, EngineId, KernelError, ManualClock, Operator, Properties, ResultHandle, Task,
    TaskId,
};
use taskhub_engine::LocalWorker;

use super::job::Job;
use super::state::{SchedulerState, TaskRecord, TaskState};
use super::{TaskScheduler, ENGINE_ID_PROPERTY};
use crate::config::SchedulerConfig;

fn props(pairs: &[(&str, serde_json::Value)]) -> Properties {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn local(name: &str) -> Arc<LocalWorker> {
    Arc::new(LocalWorker::new(name))
}

/// Poll until `task` matches `pred`, failing the test after two seconds.
async fn wait_for(
    scheduler: &TaskScheduler,
    task: TaskId,
    pred: impl Fn(&TaskRecord) -> bool,
) -> TaskRecord {
    for _ in 0..400 {
        if let Some(record) = scheduler.task_status(task) {
            if pred(&record) {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {task} never reached the expected state");
}

#[test]
fn requeue_restores_submission_position() {
    let mut state = SchedulerState::default();
    let client = taskhub_core::ClientId::new();
    for id in 0..3 {
        let handle = ResultHandle::new(client, id);
        state.records.insert(TaskId(id), TaskRecord::new(TaskId(id), handle));
    }
    for id in [0, 2] {
        let handle = ResultHandle::new(client, id);
        state.backlog.insert(TaskId(id), Job::new(TaskId(id), handle, Arc::new(Task::new("pass"))));
    }

    // Task 1 was running and failed: it goes back between 0 and 2.
    state.records.get_mut(&TaskId(1)).unwrap().state = TaskState::Running;
    let job = Job::new(TaskId(1), ResultHandle::new(client, 1), Arc::new(Task::new("raise")));
    state.requeue(job);

    let order: Vec<TaskId> = state.backlog.keys().copied().collect();
    assert_eq!(order, [TaskId(0), TaskId(1), TaskId(2)]);
    assert_eq!(state.records[&TaskId(1)].state, TaskState::Pending);
}

#[tokio::test]
async fn engine_id_is_stamped_and_protected() {
    let scheduler = TaskScheduler::new(SchedulerConfig::default());
    let a = scheduler.register(local("a"), props(&[("rank", json!(0))]));
    let b = scheduler.register(local("b"), Properties::new());
    assert_eq!(scheduler.engines(), [a, b]);

    scheduler
        .update_properties(a, props(&[(ENGINE_ID_PROPERTY, json!(99)), ("gpu", json!(true))]))
        .unwrap();
    let status = scheduler.engine_status(a).unwrap();
    assert_eq!(status.properties.get(ENGINE_ID_PROPERTY), Some(&json!(a.0)));
    assert_eq!(status.properties.get("gpu"), Some(&json!(true)));

    scheduler.set_properties(b, Properties::new()).unwrap();
    let status = scheduler.engine_status(b).unwrap();
    assert_eq!(status.properties, props(&[(ENGINE_ID_PROPERTY, json!(b.0))]));

    assert_eq!(
        scheduler.engine_status(EngineId(42)).unwrap_err(),
        KernelError::UnknownEngine(EngineId(42))
    );
}

#[tokio::test]
async fn run_rejects_deep_recovery_chain() {
    let config = SchedulerConfig {
        max_recovery_depth: 1,
        ..Default::default()
    };
    let scheduler = TaskScheduler::new(config);
    let task = Task::builder("a")
        .recovery(Task::builder("b").recovery(Task::new("c")).build())
        .build();

    assert!(matches!(scheduler.run(task), Err(KernelError::InvalidTask(_))));
    assert_eq!(scheduler.metrics().submitted, 0);
}

#[tokio::test]
async fn zero_recovery_depth_allows_plain_tasks_only() {
    let config = SchedulerConfig::from_toml("max_recovery_depth = 0").unwrap();
    let scheduler = TaskScheduler::new(config);

    assert!(scheduler.run(Task::new("a")).is_ok());
    let with_recovery = Task::builder("a").recovery(Task::new("b")).build();
    assert!(matches!(scheduler.run(with_recovery), Err(KernelError::InvalidTask(_))));
    assert_eq!(scheduler.metrics().submitted, 1);
}

#[tokio::test]
async fn run_without_engines_is_configurable() {
    let lenient = TaskScheduler::new(SchedulerConfig::default());
    let handle = lenient.run(Task::new("pass")).unwrap();
    assert_eq!(lenient.task_status(handle.task).unwrap().state, TaskState::Pending);

    let strict = TaskScheduler::new(SchedulerConfig {
        reject_without_engines: true,
        ..Default::default()
    });
    assert!(matches!(
        strict.run(Task::new("pass")),
        Err(KernelError::EngineUnavailable(_))
    ));
}

#[tokio::test]
async fn check_satisfiable_reflects_current_engines() {
    let scheduler = TaskScheduler::new(SchedulerConfig::default());
    let task = Task::builder("x = 1")
        .dependency(Dependency::constraints([("rank", json!(5), Operator::Ge)]))
        .build();
    let handle = scheduler.run(task).unwrap();

    assert_eq!(
        scheduler.check_satisfiable(handle.task),
        Err(KernelError::DependencyUnsatisfiable(handle.task))
    );
    assert_eq!(
        scheduler.check_satisfiable(TaskId(77)),
        Err(KernelError::TaskNotFound(TaskId(77)))
    );

    scheduler.register(local("low"), props(&[("rank", json!(1))]));
    assert!(scheduler.check_satisfiable(handle.task).is_err());

    scheduler.register(local("high"), props(&[("rank", json!(7))]));
    scheduler.get_task_result(handle, true).await.unwrap();
    assert_eq!(scheduler.check_satisfiable(handle.task), Ok(()));
}

#[tokio::test]
async fn failed_engine_sits_out_penalty() {
    let clock = Arc::new(ManualClock::new());
    let config = SchedulerConfig {
        failure_penalty_ms: 60_000,
        ..Default::default()
    };
    let scheduler = TaskScheduler::with_clock(config, clock.clone());
    let engine = scheduler.register(local("only"), Properties::new());

    let handle = scheduler
        .run(Task::builder("raise flaky").retries(1).build())
        .unwrap();
    wait_for(&scheduler, handle.task, |r| {
        r.attempts == 1 && r.state == TaskState::Pending
    })
    .await;

    for _ in 0..5 {
        assert_eq!(scheduler.spin(), 0);
        tokio::task::yield_now().await;
    }
    assert_eq!(scheduler.task_status(handle.task).unwrap().attempts, 1);
    assert_eq!(scheduler.status().penalized, [engine]);

    clock.advance(Duration::from_secs(61));
    assert_eq!(scheduler.spin(), 1);
    let err = scheduler.get_task_result(handle, true).await.unwrap_err();
    assert_eq!(err.remote_failure().unwrap().ename, "RuntimeError");
    assert_eq!(scheduler.task_status(handle.task).unwrap().attempts, 2);
}

#[tokio::test]
async fn abort_only_applies_to_pending_tasks() {
    let scheduler = TaskScheduler::new(SchedulerConfig::default());
    let engine = scheduler.register(local("e"), Properties::new());

    let slow = scheduler.run(Task::new("sleep 10000")).unwrap();
    let queued = scheduler.run(Task::new("x = 1")).unwrap();
    wait_for(&scheduler, slow.task, |r| r.state == TaskState::Running).await;

    assert_eq!(
        scheduler.abort(slow.task),
        Err(KernelError::TaskAlreadyRunning(slow.task))
    );
    scheduler.abort(queued.task).unwrap();
    assert_eq!(
        scheduler.get_task_result(queued, false).await,
        Err(KernelError::Aborted(queued.task))
    );
    assert_eq!(
        scheduler.abort(queued.task),
        Err(KernelError::TaskNotFound(queued.task))
    );

    assert!(scheduler.interrupt_engine(engine).await.unwrap());
    let err = scheduler.get_task_result(slow, true).await.unwrap_err();
    assert_eq!(err, KernelError::Interrupted(engine));

    let status = scheduler.status();
    assert_eq!(status.count(TaskState::Aborted), 1);
    assert_eq!(status.count(TaskState::FailedFinal), 1);
    assert_eq!(scheduler.metrics().aborted, 1);
}

#[tokio::test]
async fn flush_forgets_finished_tasks() {
    let scheduler = TaskScheduler::new(SchedulerConfig::default());
    scheduler.register(local("e"), Properties::new());

    let done = scheduler.run(Task::new("a = 1")).unwrap();
    scheduler.get_task_result(done, true).await.unwrap();
    let waiting = scheduler
        .run(Task::builder("b = 2").dependency(Dependency::exact([("never", json!(true))])).build())
        .unwrap();

    assert_eq!(scheduler.flush(scheduler.default_client()).unwrap(), 1);
    assert!(scheduler.task_status(done.task).is_none());
    assert!(scheduler.task_status(waiting.task).is_some());
    assert_eq!(
        scheduler.get_task_result(done, false).await,
        Err(KernelError::InvalidHandle(done.result))
    );
}

#[tokio::test]
async fn unregistered_engine_is_no_longer_scheduled() {
    let scheduler = TaskScheduler::new(SchedulerConfig::default());
    let engine = scheduler.register(local("gone"), Properties::new());
    scheduler.unregister(engine).unwrap();
    assert!(scheduler.engines().is_empty());
    assert_eq!(scheduler.unregister(engine), Err(KernelError::UnknownEngine(engine)));

    let handle = scheduler.run(Task::new("pass")).unwrap();
    assert_eq!(scheduler.spin(), 0);
    assert!(lock(&scheduler.inner.state).backlog.contains_key(&handle.task));
}
