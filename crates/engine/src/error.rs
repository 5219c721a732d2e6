use taskhub_core::{EngineId, KernelError, RemoteFailure};
use thiserror::Error;

/// Failures at the worker execution boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// Connection to the worker is gone. The queue disconnects itself.
    #[error("worker disconnected: {0}")]
    Disconnected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Worker-side code raised while handling push/pull.
    #[error("remote error: {0}")]
    Remote(RemoteFailure),
}

impl WorkerError {
    /// Attach the engine id and lift into the kernel taxonomy.
    pub fn into_kernel(self, engine: EngineId) -> KernelError {
        match self {
            Self::Disconnected(reason) => KernelError::EngineDisconnected { engine, reason },
            Self::Transport(message) => KernelError::Transport { engine, message },
            Self::Unsupported(op) => KernelError::Transport {
                engine,
                message: format!("unsupported operation: {op}"),
            },
            Self::Remote(failure) => KernelError::RemoteExecution(failure),
        }
    }
}
