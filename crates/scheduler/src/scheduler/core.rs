use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

use taskhub_broker::PendingResultBroker;
use taskhub_core::sync::{lock, read};
use taskhub_core::{
    Clock, ClientId, EngineId, KernelError, Properties, Reply, ResultHandle, SystemClock, TaskId,
};
use taskhub_engine::{EngineQueue, EngineStatus, QueueEvent, Worker};

use crate::config::SchedulerConfig;

use super::metrics::SchedulerMetrics;
use super::penalty::{FailurePenalty, PenaltyState};
use super::state::{EngineSlot, SchedulerState};

/// Property stamped on every engine with its id, so dependencies can name
/// (or exclude) specific engines.
pub const ENGINE_ID_PROPERTY: &str = "engine_id";

/// Returned by `run`: the scheduler's task id plus the result handle the
/// outcome is resolved into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskHandle {
    pub task: TaskId,
    pub result: ResultHandle,
}

impl From<TaskHandle> for ResultHandle {
    fn from(handle: TaskHandle) -> Self {
        handle.result
    }
}

pub(super) struct Shared {
    pub(super) config: SchedulerConfig,
    pub(super) penalty: FailurePenalty,
    pub(super) broker: Arc<PendingResultBroker<Reply>>,
    pub(super) clock: Arc<dyn Clock>,
    /// Client used by `run` and `get_task_result`.
    pub(super) default_client: ClientId,
    /// Client owning the engine queues' command handles.
    pub(super) command_client: ClientId,
    pub(super) state: Mutex<SchedulerState>,
    pub(super) events: mpsc::UnboundedSender<QueueEvent>,
    pub(super) metrics: RwLock<SchedulerMetrics>,
}

/// Owns the engine pool and the task backlog, pairs pending tasks with idle
/// engines whose properties satisfy their dependency, and drives retry and
/// recovery. Outcomes are published through a [`PendingResultBroker`].
///
/// Cheap to clone; clones share one scheduler. All admission decisions are
/// serialized by a single internal mutex, which is never held across an
/// await point.
#[derive(Clone)]
pub struct TaskScheduler {
    pub(super) inner: Arc<Shared>,
}

impl TaskScheduler {
    /// Create a scheduler with the system clock. Must be called inside a tokio runtime.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a scheduler with an injected clock (used by the failure penalty).
    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let broker = Arc::new(PendingResultBroker::new());
        let default_client = broker.register_client();
        let command_client = broker.register_client();
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Shared {
            penalty: FailurePenalty::from_config(&config),
            config,
            broker,
            clock,
            default_client,
            command_client,
            state: Mutex::new(SchedulerState::default()),
            events: tx,
            metrics: RwLock::new(SchedulerMetrics::default()),
        });
        tokio::spawn(pump(Arc::downgrade(&inner), rx));
        info!(config = ?inner.config, "task scheduler started");
        Self { inner }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn broker(&self) -> &Arc<PendingResultBroker<Reply>> {
        &self.inner.broker
    }

    /// Client whose namespace holds handles returned by [`run`](Self::run).
    pub fn default_client(&self) -> ClientId {
        self.inner.default_client
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        read(&self.inner.metrics).clone()
    }

    // ── Engine registry ─────────────────────────────────────────────

    /// Add an engine backed by `worker`. Its properties are stamped with
    /// [`ENGINE_ID_PROPERTY`]. Triggers a scheduling pass.
    pub fn register(&self, worker: Arc<dyn Worker>, properties: Properties) -> EngineId {
        let shared = &self.inner;
        let id = {
            let mut state = lock(&shared.state);
            let id = EngineId(state.next_engine);
            state.next_engine += 1;
            let queue = EngineQueue::builder(id, worker, shared.broker.clone())
                .client(shared.command_client)
                .properties(stamp(id, properties))
                .history_limit(shared.config.history_limit)
                .events(shared.events.clone())
                .spawn();
            state.engines.insert(
                id,
                EngineSlot {
                    queue,
                    running: None,
                    penalty: PenaltyState::default(),
                },
            );
            id
        };
        info!(engine = %id, "engine registered");
        shared.schedule_pass();
        id
    }

    /// Remove an engine. Its in-flight command fails with a disconnect and
    /// the task goes through the usual retry policy.
    pub fn unregister(&self, engine: EngineId) -> Result<(), KernelError> {
        let slot = lock(&self.inner.state)
            .engines
            .remove(&engine)
            .ok_or(KernelError::UnknownEngine(engine))?;
        slot.queue.disconnect("unregistered");
        info!(engine = %engine, "engine unregistered");
        Ok(())
    }

    /// Registered engine ids, ascending.
    pub fn engines(&self) -> Vec<EngineId> {
        lock(&self.inner.state).engines.keys().copied().collect()
    }

    /// Merge `updates` into an engine's properties. Takes effect on the next
    /// scheduling pass, which this triggers.
    pub fn update_properties(&self, engine: EngineId, mut updates: Properties) -> Result<(), KernelError> {
        updates.remove(ENGINE_ID_PROPERTY);
        self.queue(engine)?.update_properties(updates);
        self.inner.schedule_pass();
        Ok(())
    }

    /// Replace an engine's properties.
    pub fn set_properties(&self, engine: EngineId, properties: Properties) -> Result<(), KernelError> {
        self.queue(engine)?.set_properties(stamp(engine, properties));
        self.inner.schedule_pass();
        Ok(())
    }

    pub fn engine_status(&self, engine: EngineId) -> Result<EngineStatus, KernelError> {
        Ok(self.queue(engine)?.status())
    }

    /// Fail every not-yet-started command on one engine with `QueueCleared`.
    pub fn clear_engine(&self, engine: EngineId) -> Result<usize, KernelError> {
        Ok(self.queue(engine)?.clear())
    }

    /// Ask one engine's worker to abandon its current command.
    pub async fn interrupt_engine(&self, engine: EngineId) -> Result<bool, KernelError> {
        let queue = self.queue(engine)?;
        queue.interrupt().await
    }

    fn queue(&self, engine: EngineId) -> Result<Arc<EngineQueue>, KernelError> {
        lock(&self.inner.state)
            .engines
            .get(&engine)
            .map(|slot| slot.queue.clone())
            .ok_or(KernelError::UnknownEngine(engine))
    }

    // ── Clients ─────────────────────────────────────────────────────

    pub fn register_client(&self) -> ClientId {
        self.inner.broker.register_client()
    }

    /// Drop a client and its handles. Tasks still running for it complete,
    /// but their outcomes are discarded.
    pub fn unregister_client(&self, client: ClientId) -> Result<usize, KernelError> {
        self.inner.broker.unregister_client(client)
    }

    /// Drop `client`'s resolved handles and the records of its finished tasks.
    pub fn flush(&self, client: ClientId) -> Result<usize, KernelError> {
        let flushed = self.inner.broker.flush(client)?;
        lock(&self.inner.state)
            .records
            .retain(|_, r| r.handle.client() != client || !r.state.is_terminal());
        Ok(flushed)
    }
}

impl Shared {
    fn remove_engine(&self, engine: EngineId, reason: &str) {
        if lock(&self.state).engines.remove(&engine).is_some() {
            warn!(engine = %engine, reason, "engine removed after disconnect");
        }
    }
}

fn stamp(engine: EngineId, mut properties: Properties) -> Properties {
    properties.insert(ENGINE_ID_PROPERTY.to_string(), json!(engine.0));
    properties
}

/// Turns queue events into scheduling passes and registry removals.
async fn pump(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<QueueEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match event {
            QueueEvent::Idle(engine) => {
                trace!(engine = %engine, "engine idle");
                shared.schedule_pass();
            }
            QueueEvent::Disconnected { engine, reason } => shared.remove_engine(engine, &reason),
        }
    }
}
