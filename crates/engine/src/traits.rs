use std::sync::Arc;

use async_trait::async_trait;
use taskhub_core::{Execution, Namespace};

use crate::error::WorkerError;

/// Worker-side capability object driven by an [`EngineQueue`](crate::EngineQueue).
///
/// The queue guarantees at most one call in flight per worker, so implementors
/// need no internal serialization. Failures must surface as a [`WorkerError`]
/// (or as [`Execution::error`] for code that raised), never as a silent no-op.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Run `code` in the worker namespace.
    async fn execute(&self, code: &str) -> Result<Execution, WorkerError>;

    /// Install every name in `namespace`.
    async fn push(&self, namespace: &Namespace) -> Result<(), WorkerError>;

    /// Read `names` back, in request order. A missing name is a remote error.
    async fn pull(&self, names: &[String]) -> Result<Namespace, WorkerError>;

    /// Clear the worker namespace.
    async fn reset(&self) -> Result<(), WorkerError>;

    /// Ask the worker to abandon its current command.
    async fn interrupt(&self) -> Result<(), WorkerError> {
        Err(WorkerError::Unsupported("interrupt".into()))
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: Worker + ?Sized> Worker for Arc<T> {
    async fn execute(&self, code: &str) -> Result<Execution, WorkerError> {
        (**self).execute(code).await
    }

    async fn push(&self, namespace: &Namespace) -> Result<(), WorkerError> {
        (**self).push(namespace).await
    }

    async fn pull(&self, names: &[String]) -> Result<Namespace, WorkerError> {
        (**self).pull(names).await
    }

    async fn reset(&self) -> Result<(), WorkerError> {
        (**self).reset().await
    }

    async fn interrupt(&self) -> Result<(), WorkerError> {
        (**self).interrupt().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
