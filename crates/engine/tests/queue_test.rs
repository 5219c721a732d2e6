//! EngineQueue behavior against scripted and mock workers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use taskhub_broker::PendingResultBroker;
use taskhub_core::{EngineId, Execution, KernelError, Namespace, Properties, Reply, ResultHandle};
use taskhub_engine::{
    Command, CommandKind, EngineQueue, LocalWorker, QueueEvent, Worker, WorkerError,
};

/// Records the code of every execute call, optionally sleeping first.
struct RecordingWorker {
    log: Mutex<Vec<String>>,
    delay: Duration,
}

impl RecordingWorker {
    fn new(delay: Duration) -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            delay,
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker for RecordingWorker {
    async fn execute(&self, code: &str) -> Result<Execution, WorkerError> {
        self.log.lock().unwrap().push(code.to_string());
        tokio::time::sleep(self.delay).await;
        Ok(Execution::default())
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
        "recording"
    }
}

fn broker() -> Arc<PendingResultBroker<Reply>> {
    Arc::new(PendingResultBroker::new())
}

async fn fetch(
    broker: &PendingResultBroker<Reply>,
    queue: &EngineQueue,
    handle: ResultHandle,
) -> Result<Reply, KernelError> {
    tokio::time::timeout(
        Duration::from_secs(5),
        broker.fetch(queue.client(), handle, true),
    )
    .await
    .expect("command never resolved")
}

async fn wait_until_running(queue: &EngineQueue) {
    for _ in 0..200 {
        if queue.status().current.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("command never started");
}

#[tokio::test]
async fn commands_start_in_submission_order() {
    let broker = broker();
    let worker = Arc::new(RecordingWorker::new(Duration::from_millis(2)));
    let queue = EngineQueue::builder(EngineId(0), worker.clone(), broker.clone()).spawn();

    let handles: Vec<_> = (0..10)
        .map(|i| queue.submit(Command::execute(format!("cmd {i}"))).unwrap())
        .collect();
    for h in handles {
        fetch(&broker, &queue, h).await.unwrap();
    }

    let expected: Vec<String> = (0..10).map(|i| format!("cmd {i}")).collect();
    assert_eq!(worker.log(), expected);
}

#[tokio::test]
async fn submit_returns_before_running() {
    let broker = broker();
    let worker = Arc::new(RecordingWorker::new(Duration::ZERO));
    let queue = EngineQueue::builder(EngineId(0), worker.clone(), broker.clone()).spawn();

    let handle = queue.submit(Command::execute("first")).unwrap();
    // No await point yet, so the driver has not run.
    assert!(worker.log().is_empty());
    assert!(broker
        .fetch(queue.client(), handle, false)
        .await
        .unwrap_err()
        .is_not_completed());

    fetch(&broker, &queue, handle).await.unwrap();
    assert_eq!(worker.log(), ["first"]);
}

#[tokio::test]
async fn push_execute_pull_round_trip() {
    let broker = broker();
    let queue = EngineQueue::builder(EngineId(4), Arc::new(LocalWorker::new("local")), broker.clone())
        .spawn();

    let push = queue
        .submit(Command::Push {
            namespace: [("y".to_string(), json!(16))].into_iter().collect(),
        })
        .unwrap();
    let exec = queue.submit(Command::execute("x = y")).unwrap();
    let pull = queue.submit(Command::pull(["x"])).unwrap();

    fetch(&broker, &queue, push).await.unwrap();
    fetch(&broker, &queue, exec).await.unwrap();
    let reply = fetch(&broker, &queue, pull).await.unwrap();
    assert_eq!(reply.engine, EngineId(4));
    assert_eq!(reply.value("x"), Some(&json!(16)));
}

#[tokio::test]
async fn clear_fails_only_pending_commands() {
    let broker = broker();
    let queue = EngineQueue::builder(EngineId(0), Arc::new(LocalWorker::new("local")), broker.clone())
        .spawn();

    let running = queue.submit(Command::execute("sleep 50; a = 1")).unwrap();
    let queued_a = queue.submit(Command::execute("b = 2")).unwrap();
    let queued_b = queue.submit(Command::Reset).unwrap();
    wait_until_running(&queue).await;

    assert_eq!(queue.clear(), 2);
    assert_eq!(
        fetch(&broker, &queue, queued_a).await.unwrap_err(),
        KernelError::QueueCleared
    );
    assert_eq!(
        fetch(&broker, &queue, queued_b).await.unwrap_err(),
        KernelError::QueueCleared
    );
    fetch(&broker, &queue, running).await.unwrap();
    assert_eq!(queue.pending_len(), 0);
}

#[tokio::test]
async fn interrupt_fails_in_flight_command() {
    let broker = broker();
    let queue = EngineQueue::builder(EngineId(2), Arc::new(LocalWorker::new("local")), broker.clone())
        .spawn();

    assert!(!queue.interrupt().await.unwrap());

    let slow = queue.submit(Command::execute("sleep 10000")).unwrap();
    let next = queue.submit(Command::execute("done = true")).unwrap();
    wait_until_running(&queue).await;

    assert!(queue.interrupt().await.unwrap());
    assert_eq!(
        fetch(&broker, &queue, slow).await.unwrap_err(),
        KernelError::Interrupted(EngineId(2))
    );
    // The queue keeps going after an interrupt.
    fetch(&broker, &queue, next).await.unwrap();
}

#[tokio::test]
async fn interrupt_unsupported_by_worker_is_an_error() {
    let broker = broker();
    let worker = Arc::new(RecordingWorker::new(Duration::from_millis(200)));
    let queue = EngineQueue::builder(EngineId(1), worker, broker.clone()).spawn();

    let handle = queue.submit(Command::execute("slow")).unwrap();
    wait_until_running(&queue).await;

    assert!(matches!(
        queue.interrupt().await,
        Err(KernelError::Transport { engine: EngineId(1), .. })
    ));
    fetch(&broker, &queue, handle).await.unwrap();
}

#[tokio::test]
async fn disconnect_fails_everything_and_closes() {
    let broker = broker();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let queue = EngineQueue::builder(EngineId(9), Arc::new(LocalWorker::new("local")), broker.clone())
        .events(tx)
        .spawn();

    let running = queue.submit(Command::execute("sleep 10000")).unwrap();
    let queued = queue.submit(Command::execute("x = 1")).unwrap();
    wait_until_running(&queue).await;

    assert!(queue.disconnect("heartbeat lost"));
    assert!(!queue.disconnect("again"));

    let expected = KernelError::EngineDisconnected {
        engine: EngineId(9),
        reason: "heartbeat lost".into(),
    };
    assert_eq!(fetch(&broker, &queue, running).await.unwrap_err(), expected);
    assert_eq!(fetch(&broker, &queue, queued).await.unwrap_err(), expected);
    assert_eq!(
        rx.recv().await,
        Some(QueueEvent::Disconnected {
            engine: EngineId(9),
            reason: "heartbeat lost".into()
        })
    );

    assert!(!queue.is_connected());
    assert_eq!(queue.submit(Command::Reset).unwrap_err(), expected);
}

#[tokio::test]
async fn lost_worker_disconnects_queue() {
    let broker = broker();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let worker = Arc::new(LocalWorker::new("local"));
    let queue = EngineQueue::builder(EngineId(3), worker.clone(), broker.clone())
        .events(tx)
        .spawn();

    worker.sever();
    let handle = queue.submit(Command::execute("pass")).unwrap();
    let err = fetch(&broker, &queue, handle).await.unwrap_err();
    assert!(matches!(err, KernelError::EngineDisconnected { engine: EngineId(3), .. }));

    match rx.recv().await {
        Some(QueueEvent::Disconnected { engine, .. }) => assert_eq!(engine, EngineId(3)),
        other => panic!("expected disconnect event, got {other:?}"),
    }
    assert!(!queue.is_connected());
}

#[tokio::test]
async fn idle_event_after_draining() {
    let broker = broker();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let queue = EngineQueue::builder(EngineId(5), Arc::new(LocalWorker::new("local")), broker.clone())
        .events(tx)
        .spawn();

    let a = queue.submit(Command::execute("a = 1")).unwrap();
    let b = queue.submit(Command::execute("b = 2")).unwrap();
    fetch(&broker, &queue, a).await.unwrap();
    fetch(&broker, &queue, b).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert_eq!(event, Some(QueueEvent::Idle(EngineId(5))));
    assert!(queue.is_idle());
}

#[tokio::test]
async fn history_is_bounded_and_ordered() {
    let broker = broker();
    let queue = EngineQueue::builder(EngineId(0), Arc::new(LocalWorker::new("local")), broker.clone())
        .history_limit(3)
        .spawn();

    let mut last = None;
    for i in 0..5 {
        let code = if i == 4 { "raise last".to_string() } else { format!("v = {i}") };
        last = Some(queue.submit(Command::execute(code)).unwrap());
    }
    let _ = fetch(&broker, &queue, last.unwrap()).await;

    let status = queue.status();
    let seqs: Vec<u64> = status.history.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, [2, 3, 4]);
    assert!(status.history[0].outcome.is_success());
    assert!(!status.history[2].outcome.is_success());
    assert_eq!(status.history[2].kind, CommandKind::Execute);
    assert!(queue.history_entry(0).is_none());
    assert_eq!(status.pending, 0);
}

#[tokio::test]
async fn properties_merge_and_replace() {
    let broker = broker();
    let initial: Properties = [("rank".to_string(), json!(0))].into_iter().collect();
    let queue = EngineQueue::builder(EngineId(0), Arc::new(LocalWorker::new("local")), broker)
        .properties(initial)
        .spawn();

    queue.update_properties([("gpu".to_string(), json!(true))].into_iter().collect());
    let props = queue.properties();
    assert_eq!(props.get("rank"), Some(&json!(0)));
    assert_eq!(props.get("gpu"), Some(&json!(true)));

    queue.set_properties(Properties::new());
    assert!(queue.status().properties.is_empty());
}
