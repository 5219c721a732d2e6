use thiserror::Error;

use crate::ids::{ClientId, EngineId, ResultHandle, TaskId};
use crate::value::RemoteFailure;

/// Errors surfaced by the scheduling kernel.
///
/// Resolved failures are stored once in the broker and handed to every reader,
/// so the type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("result {0} is not completed")]
    NotCompleted(ResultHandle),

    #[error("invalid result handle: {0}")]
    InvalidHandle(ResultHandle),

    #[error("invalid client: {0}")]
    InvalidClient(ClientId),

    #[error("result {0} was already resolved")]
    AlreadyResolved(ResultHandle),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {0} is already running")]
    TaskAlreadyRunning(TaskId),

    #[error("no engine available: {0}")]
    EngineUnavailable(String),

    #[error("unknown engine: {0}")]
    UnknownEngine(EngineId),

    #[error("no registered engine satisfies the dependency of task {0}")]
    DependencyUnsatisfiable(TaskId),

    #[error("remote execution failed: {0}")]
    RemoteExecution(RemoteFailure),

    #[error("queue cleared before the command started")]
    QueueCleared,

    #[error("engine {engine} disconnected: {reason}")]
    EngineDisconnected { engine: EngineId, reason: String },

    #[error("command on engine {0} was interrupted")]
    Interrupted(EngineId),

    #[error("task {0} was aborted")]
    Aborted(TaskId),

    #[error("transport error on engine {engine}: {message}")]
    Transport { engine: EngineId, message: String },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    #[error("config error: {0}")]
    Config(String),
}

impl KernelError {
    /// Whether this is the expected "poll again later" outcome of a non-blocking fetch.
    pub fn is_not_completed(&self) -> bool {
        matches!(self, Self::NotCompleted(_))
    }

    /// Remote failure payload, if the worker-side code raised.
    pub fn remote_failure(&self) -> Option<&RemoteFailure> {
        match self {
            Self::RemoteExecution(f) => Some(f),
            _ => None,
        }
    }
}
