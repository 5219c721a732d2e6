//! Serialized command queue in front of one worker.
//!
//! `submit` only enqueues. A background driver task moves commands from
//! `pending` to `current` one at a time, runs them against the worker and
//! resolves their handles in the shared broker. The driver holds a weak
//! reference, so dropping the last `Arc<EngineQueue>` stops it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, instrument, warn};

use taskhub_broker::PendingResultBroker;
use taskhub_core::sync::lock;
use taskhub_core::{ClientId, EngineId, KernelError, Properties, Reply, ResultHandle};

use crate::command::{Command, CommandKind};
use crate::history::{CommandOutcome, History, HistoryEntry};
use crate::traits::Worker;

/// Default capacity of the per-engine history log.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Signals emitted by a queue to whoever drives scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// The queue finished a command and has nothing left to run.
    Idle(EngineId),
    /// The worker connection is gone. Every outstanding command has failed.
    Disconnected { engine: EngineId, reason: String },
}

/// Snapshot of the in-flight command.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentCommand {
    pub seq: u64,
    pub kind: CommandKind,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time view of a queue: pending count, history and properties.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub engine: EngineId,
    pub worker: String,
    pub connected: bool,
    pub pending: usize,
    pub current: Option<CurrentCommand>,
    pub history: Vec<HistoryEntry>,
    pub properties: Properties,
}

struct Queued {
    seq: u64,
    command: Command,
    handle: ResultHandle,
    submitted_at: DateTime<Utc>,
}

struct InFlight {
    seq: u64,
    kind: CommandKind,
    handle: ResultHandle,
    submitted_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    abort: Option<oneshot::Sender<KernelError>>,
}

struct QueueState {
    pending: VecDeque<Queued>,
    current: Option<InFlight>,
    history: History,
    properties: Properties,
    next_seq: u64,
    /// Disconnect reason once the queue is closed.
    closed: Option<String>,
}

struct Started {
    seq: u64,
    command: Command,
    handle: ResultHandle,
    abort: oneshot::Receiver<KernelError>,
}

enum Next {
    Run(Started),
    Wait,
    Stop,
}

pub struct EngineQueue {
    id: EngineId,
    worker: Arc<dyn Worker>,
    broker: Arc<PendingResultBroker<Reply>>,
    client: ClientId,
    state: Mutex<QueueState>,
    wake: Arc<Notify>,
    events: Option<mpsc::UnboundedSender<QueueEvent>>,
}

/// Fluent builder for [`EngineQueue`].
///
/// # Example
/// ```ignore
/// let queue = EngineQueue::builder(EngineId(0), worker, broker)
///     .properties(props)
///     .history_limit(50)
///     .spawn();
/// ```
pub struct EngineQueueBuilder {
    id: EngineId,
    worker: Arc<dyn Worker>,
    broker: Arc<PendingResultBroker<Reply>>,
    client: Option<ClientId>,
    properties: Properties,
    history_limit: usize,
    events: Option<mpsc::UnboundedSender<QueueEvent>>,
}

impl EngineQueueBuilder {
    /// Broker client owning this queue's command handles. A fresh client is
    /// registered when unset.
    pub fn client(mut self, client: ClientId) -> Self {
        self.client = Some(client);
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Number of completed commands kept (default: 100).
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Channel receiving [`QueueEvent`]s.
    pub fn events(mut self, tx: mpsc::UnboundedSender<QueueEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Create the queue and start its driver. Must be called inside a tokio runtime.
    pub fn spawn(self) -> Arc<EngineQueue> {
        let client = self
            .client
            .unwrap_or_else(|| self.broker.register_client());
        let queue = Arc::new(EngineQueue {
            id: self.id,
            worker: self.worker,
            broker: self.broker,
            client,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                current: None,
                history: History::new(self.history_limit),
                properties: self.properties,
                next_seq: 0,
                closed: None,
            }),
            wake: Arc::new(Notify::new()),
            events: self.events,
        });
        info!(engine = %queue.id, worker = queue.worker.name(), "engine queue started");
        tokio::spawn(drive(Arc::downgrade(&queue), queue.wake.clone()));
        queue
    }
}

impl EngineQueue {
    pub fn builder(
        id: EngineId,
        worker: Arc<dyn Worker>,
        broker: Arc<PendingResultBroker<Reply>>,
    ) -> EngineQueueBuilder {
        EngineQueueBuilder {
            id,
            worker,
            broker,
            client: None,
            properties: Properties::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            events: None,
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn worker_name(&self) -> &str {
        self.worker.name()
    }

    // ── Submission ─────────────────────────────────────────────────

    /// Enqueue `command` and return its handle. Never runs the command inline.
    pub fn submit(&self, command: Command) -> Result<ResultHandle, KernelError> {
        let (seq, handle) = {
            let mut state = lock(&self.state);
            if let Some(reason) = &state.closed {
                return Err(KernelError::EngineDisconnected {
                    engine: self.id,
                    reason: reason.clone(),
                });
            }
            let handle = self.broker.new_handle(self.client)?;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push_back(Queued {
                seq,
                command,
                handle,
                submitted_at: Utc::now(),
            });
            (seq, handle)
        };
        debug!(engine = %self.id, seq, handle = %handle, "command queued");
        self.wake.notify_one();
        Ok(handle)
    }

    /// Fail every queued command that has not started with `QueueCleared`.
    /// The in-flight command is unaffected. Returns how many were cleared.
    pub fn clear(&self) -> usize {
        let cleared: Vec<Queued> = {
            let mut state = lock(&self.state);
            let cleared: Vec<Queued> = state.pending.drain(..).collect();
            let now = Utc::now();
            for q in &cleared {
                state.history.push(HistoryEntry {
                    seq: q.seq,
                    kind: q.command.kind(),
                    submitted_at: q.submitted_at,
                    started_at: None,
                    finished_at: now,
                    outcome: CommandOutcome::Failed(KernelError::QueueCleared.to_string()),
                });
            }
            cleared
        };
        for q in &cleared {
            self.resolve(q.handle, Err(KernelError::QueueCleared));
        }
        info!(engine = %self.id, cleared = cleared.len(), "queue cleared");
        cleared.len()
    }

    /// Ask the worker to abandon the in-flight command.
    ///
    /// Returns `Ok(false)` when idle. Once the worker acknowledges, the
    /// in-flight command fails with `Interrupted` and the queue moves on.
    pub async fn interrupt(&self) -> Result<bool, KernelError> {
        let current = lock(&self.state).current.as_ref().map(|c| c.seq);
        let Some(seq) = current else {
            return Ok(false);
        };

        self.worker
            .interrupt()
            .await
            .map_err(|e| e.into_kernel(self.id))?;

        let abort = {
            let mut state = lock(&self.state);
            match state.current.as_mut() {
                Some(c) if c.seq == seq => c.abort.take(),
                _ => None,
            }
        };
        let interrupted = abort
            .map(|tx| tx.send(KernelError::Interrupted(self.id)).is_ok())
            .unwrap_or(false);
        info!(engine = %self.id, seq, interrupted, "interrupt requested");
        Ok(interrupted)
    }

    /// Fail the in-flight command and every pending one, then close the queue.
    ///
    /// Returns false if the queue was already closed.
    pub fn disconnect(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let (abort, drained) = {
            let mut state = lock(&self.state);
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason.clone());
            let abort = state.current.as_mut().and_then(|c| c.abort.take());
            let drained: Vec<Queued> = state.pending.drain(..).collect();
            (abort, drained)
        };

        let err = KernelError::EngineDisconnected {
            engine: self.id,
            reason: reason.clone(),
        };
        if let Some(tx) = abort {
            let _ = tx.send(err.clone());
        }
        for q in &drained {
            self.resolve(q.handle, Err(err.clone()));
        }
        warn!(engine = %self.id, reason = %reason, failed = drained.len(), "engine disconnected");

        self.wake.notify_one();
        self.emit(QueueEvent::Disconnected {
            engine: self.id,
            reason,
        });
        true
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn status(&self) -> EngineStatus {
        let state = lock(&self.state);
        EngineStatus {
            engine: self.id,
            worker: self.worker.name().to_string(),
            connected: state.closed.is_none(),
            pending: state.pending.len(),
            current: state.current.as_ref().map(|c| CurrentCommand {
                seq: c.seq,
                kind: c.kind,
                started_at: c.started_at,
            }),
            history: state.history.snapshot(),
            properties: state.properties.clone(),
        }
    }

    /// No command running and none waiting.
    pub fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        state.current.is_none() && state.pending.is_empty()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).closed.is_none()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn history_entry(&self, seq: u64) -> Option<HistoryEntry> {
        lock(&self.state).history.get(seq).cloned()
    }

    pub fn properties(&self) -> Properties {
        lock(&self.state).properties.clone()
    }

    /// Replace the property map.
    pub fn set_properties(&self, properties: Properties) {
        lock(&self.state).properties = properties;
    }

    /// Merge `updates` into the property map, overwriting existing keys.
    pub fn update_properties(&self, updates: Properties) {
        lock(&self.state).properties.extend(updates);
    }

    // ── Driver side ────────────────────────────────────────────────

    fn start_next(&self) -> Next {
        let mut state = lock(&self.state);
        if state.current.is_some() {
            return Next::Wait;
        }
        let Some(queued) = state.pending.pop_front() else {
            return if state.closed.is_some() {
                Next::Stop
            } else {
                Next::Wait
            };
        };
        let (tx, rx) = oneshot::channel();
        state.current = Some(InFlight {
            seq: queued.seq,
            kind: queued.command.kind(),
            handle: queued.handle,
            submitted_at: queued.submitted_at,
            started_at: Utc::now(),
            abort: Some(tx),
        });
        Next::Run(Started {
            seq: queued.seq,
            command: queued.command,
            handle: queued.handle,
            abort: rx,
        })
    }

    #[instrument(skip_all, fields(engine = %self.id, seq = started.seq, kind = %started.command.kind()))]
    async fn run(&self, started: Started) {
        let Started {
            seq,
            command,
            handle,
            mut abort,
        } = started;

        // An acknowledged abort wins over a result that raced it.
        let outcome = tokio::select! {
            biased;
            Ok(err) = &mut abort => Err(err),
            outcome = command.perform(self.worker.as_ref(), self.id) => outcome,
        };
        self.finish(seq, handle, outcome);
    }

    fn finish(&self, seq: u64, handle: ResultHandle, outcome: Result<Reply, KernelError>) {
        let disconnected = match &outcome {
            Err(KernelError::EngineDisconnected { reason, .. }) => Some(reason.clone()),
            _ => None,
        };

        let (idle, connected) = {
            let mut state = lock(&self.state);
            let now = Utc::now();
            let current = state.current.take();
            let (kind, submitted_at, started_at) = match current {
                Some(c) => (c.kind, c.submitted_at, c.started_at),
                None => (CommandKind::Execute, now, now),
            };
            state.history.push(HistoryEntry {
                seq,
                kind,
                submitted_at,
                started_at: Some(started_at),
                finished_at: now,
                outcome: match &outcome {
                    Ok(_) => CommandOutcome::Succeeded,
                    Err(e) => CommandOutcome::Failed(e.to_string()),
                },
            });
            (state.pending.is_empty(), state.closed.is_none())
        };

        match &outcome {
            Ok(_) => debug!(engine = %self.id, seq, "command succeeded"),
            Err(e) => debug!(engine = %self.id, seq, error = %e, "command failed"),
        }
        // The queue is closed before the outcome is published.
        let lost = disconnected.is_some();
        if let Some(reason) = disconnected {
            self.disconnect(reason);
        }
        self.resolve(handle, outcome);

        if !lost && idle && connected {
            self.emit(QueueEvent::Idle(self.id));
        }
    }

    fn resolve(&self, handle: ResultHandle, outcome: Result<Reply, KernelError>) {
        if let Err(e) = self.broker.resolve(handle, outcome) {
            // The owning client may have been unregistered meanwhile.
            debug!(engine = %self.id, handle = %handle, error = %e, "command result dropped");
        }
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

impl Drop for EngineQueue {
    fn drop(&mut self) {
        let drained: Vec<Queued> = lock(&self.state).pending.drain(..).collect();
        for q in drained {
            self.resolve(
                q.handle,
                Err(KernelError::EngineDisconnected {
                    engine: self.id,
                    reason: "engine queue dropped".into(),
                }),
            );
        }
        self.wake.notify_one();
    }
}

async fn drive(queue: Weak<EngineQueue>, wake: Arc<Notify>) {
    loop {
        let Some(q) = queue.upgrade() else {
            break;
        };
        match q.start_next() {
            Next::Run(started) => q.run(started).await,
            Next::Wait => {
                drop(q);
                wake.notified().await;
            }
            Next::Stop => break,
        }
    }
    debug!("engine queue driver stopped");
}
