//! Per-engine serialized command queues and the worker execution boundary.
//!
//! An [`EngineQueue`] wraps one [`Worker`] and guarantees that at most one
//! command is in flight against it. Command outcomes are published through a
//! shared [`PendingResultBroker`](taskhub_broker::PendingResultBroker).

pub mod command;
pub mod error;
pub mod history;
pub mod local;
pub mod queue;
pub mod traits;

pub use command::{Command, CommandKind};
pub use error::WorkerError;
pub use history::{CommandOutcome, History, HistoryEntry};
pub use local::LocalWorker;
pub use queue::{CurrentCommand, EngineQueue, EngineQueueBuilder, EngineStatus, QueueEvent};
pub use traits::Worker;
