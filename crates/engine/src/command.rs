use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use taskhub_core::{EngineId, KernelError, Namespace, Reply, Task};

use crate::traits::Worker;

/// A unit of work submitted to an [`EngineQueue`](crate::EngineQueue).
#[derive(Debug, Clone)]
pub enum Command {
    Execute { code: String },
    Push { namespace: Namespace },
    Pull { names: Vec<String> },
    Reset,
    /// Full task sequence: optional reset, push, execute, pull, optional reset.
    /// Runs as one command so nothing interleaves on the worker.
    RunTask(Arc<Task>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Execute,
    Push,
    Pull,
    Reset,
    RunTask,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Execute => "execute",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Reset => "reset",
            Self::RunTask => "run_task",
        };
        f.write_str(s)
    }
}

impl Command {
    pub fn execute(code: impl Into<String>) -> Self {
        Self::Execute { code: code.into() }
    }

    pub fn pull<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Pull {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Execute { .. } => CommandKind::Execute,
            Self::Push { .. } => CommandKind::Push,
            Self::Pull { .. } => CommandKind::Pull,
            Self::Reset => CommandKind::Reset,
            Self::RunTask(_) => CommandKind::RunTask,
        }
    }

    /// Drive the command against `worker`.
    pub(crate) async fn perform(
        &self,
        worker: &dyn Worker,
        engine: EngineId,
    ) -> Result<Reply, KernelError> {
        let lift = |e: crate::WorkerError| e.into_kernel(engine);
        match self {
            Self::Execute { code } => execute(worker, engine, code).await,
            Self::Push { namespace } => {
                worker.push(namespace).await.map_err(lift)?;
                Ok(Reply::empty(engine))
            }
            Self::Pull { names } => {
                let values = worker.pull(names).await.map_err(lift)?;
                Ok(Reply {
                    values,
                    ..Reply::empty(engine)
                })
            }
            Self::Reset => {
                worker.reset().await.map_err(lift)?;
                Ok(Reply::empty(engine))
            }
            Self::RunTask(task) => run_task(worker, engine, task).await,
        }
    }
}

async fn execute(worker: &dyn Worker, engine: EngineId, code: &str) -> Result<Reply, KernelError> {
    let execution = worker
        .execute(code)
        .await
        .map_err(|e| e.into_kernel(engine))?;
    if let Some(failure) = execution.error {
        return Err(KernelError::RemoteExecution(failure));
    }
    Ok(Reply {
        engine,
        stdout: execution.stdout,
        stderr: execution.stderr,
        values: Namespace::new(),
    })
}

async fn run_task(worker: &dyn Worker, engine: EngineId, task: &Task) -> Result<Reply, KernelError> {
    let outcome = run_task_body(worker, engine, task).await;
    if !task.clear_after() {
        return outcome;
    }
    // The namespace is reset even when the body failed.
    let cleared = worker.reset().await.map_err(|e| e.into_kernel(engine));
    match (outcome, cleared) {
        (Ok(_), Err(e)) => Err(e),
        (outcome, _) => outcome,
    }
}

async fn run_task_body(
    worker: &dyn Worker,
    engine: EngineId,
    task: &Task,
) -> Result<Reply, KernelError> {
    let lift = |e: crate::WorkerError| e.into_kernel(engine);
    if task.clear_before() {
        worker.reset().await.map_err(lift)?;
    }
    if !task.push().is_empty() {
        worker.push(task.push()).await.map_err(lift)?;
    }
    let mut reply = execute(worker, engine, task.code()).await?;
    if !task.pull().is_empty() {
        reply.values = worker.pull(task.pull()).await.map_err(lift)?;
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalWorker;
    use serde_json::json;

    #[tokio::test]
    async fn run_task_pushes_executes_and_pulls() {
        let worker = LocalWorker::new("w");
        let task = Task::builder("x = y")
            .push_value("y", json!(16))
            .pull("x")
            .build();

        let reply = Command::RunTask(Arc::new(task))
            .perform(&worker, EngineId(1))
            .await
            .unwrap();
        assert_eq!(reply.engine, EngineId(1));
        assert_eq!(reply.value("x"), Some(&json!(16)));
    }

    #[tokio::test]
    async fn raising_code_is_a_remote_failure() {
        let worker = LocalWorker::new("w");
        let err = Command::execute("raise boom")
            .perform(&worker, EngineId(0))
            .await
            .unwrap_err();
        let failure = err.remote_failure().unwrap();
        assert_eq!(failure.ename, "RuntimeError");
        assert_eq!(failure.evalue, "boom");
    }

    #[tokio::test]
    async fn clear_after_runs_even_on_failure() {
        let worker = LocalWorker::new("w");
        Command::Push {
            namespace: [("stale".to_string(), json!(1))].into_iter().collect(),
        }
        .perform(&worker, EngineId(0))
        .await
        .unwrap();

        let task = Task::builder("raise").clear_after(true).build();
        assert!(Command::RunTask(Arc::new(task))
            .perform(&worker, EngineId(0))
            .await
            .is_err());

        let err = Command::pull(["stale"])
            .perform(&worker, EngineId(0))
            .await
            .unwrap_err();
        assert_eq!(err.remote_failure().unwrap().ename, "NameError");
    }

    #[test]
    fn kind_display() {
        assert_eq!(Command::Reset.kind().to_string(), "reset");
        assert_eq!(Command::execute("pass").kind(), CommandKind::Execute);
    }
}
