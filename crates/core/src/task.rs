use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dependency::Dependency;
use crate::value::Namespace;

/// When a task's recovery task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Substitute the recovery task once retries are exhausted.
    #[default]
    OnExhausted,
    /// Also run the recovery task as a cleanup step after every failure that
    /// still has retries left, then re-run the original.
    BeforeEachRetry,
}

/// An immutable unit of remote work.
///
/// Built through [`TaskBuilder`]. A recovery task is owned by its parent, so a
/// recovery chain is acyclic by construction.
#[derive(Debug, Clone)]
pub struct Task {
    code: String,
    push: Namespace,
    pull: Vec<String>,
    clear_before: bool,
    clear_after: bool,
    dependency: Dependency,
    retries: u32,
    recovery: Option<Arc<Task>>,
    recovery_mode: RecoveryMode,
}

impl Task {
    /// Task running `code` with no namespace traffic, no dependency and no retries.
    pub fn new(code: impl Into<String>) -> Self {
        Self::builder(code).build()
    }

    pub fn builder(code: impl Into<String>) -> TaskBuilder {
        TaskBuilder {
            task: Task {
                code: code.into(),
                push: Namespace::new(),
                pull: Vec::new(),
                clear_before: false,
                clear_after: false,
                dependency: Dependency::always(),
                retries: 0,
                recovery: None,
                recovery_mode: RecoveryMode::OnExhausted,
            },
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn push(&self) -> &Namespace {
        &self.push
    }

    pub fn pull(&self) -> &[String] {
        &self.pull
    }

    pub fn clear_before(&self) -> bool {
        self.clear_before
    }

    pub fn clear_after(&self) -> bool {
        self.clear_after
    }

    pub fn dependency(&self) -> &Dependency {
        &self.dependency
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn recovery(&self) -> Option<&Arc<Task>> {
        self.recovery.as_ref()
    }

    pub fn recovery_mode(&self) -> RecoveryMode {
        self.recovery_mode
    }

    /// Number of recovery tasks reachable from this one.
    pub fn recovery_depth(&self) -> usize {
        let mut depth = 0;
        let mut next = self.recovery.as_deref();
        while let Some(task) = next {
            depth += 1;
            next = task.recovery.as_deref();
        }
        depth
    }
}

/// Fluent builder for [`Task`].
///
/// # Example
/// ```
/// use serde_json::json;
/// use taskhub_core::{Dependency, Task};
///
/// let task = Task::builder("x = y")
///     .push_value("y", json!(16))
///     .pull("x")
///     .dependency(Dependency::exact([("rank", json!(0))]))
///     .retries(2)
///     .recovery(Task::builder("x = 0").pull("x").build())
///     .build();
/// assert_eq!(task.recovery_depth(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    /// Install a single name before the code runs.
    pub fn push_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.task.push.insert(name.into(), value);
        self
    }

    /// Replace the whole namespace pushed before the code runs.
    pub fn push_namespace(mut self, namespace: Namespace) -> Self {
        self.task.push = namespace;
        self
    }

    /// Retrieve a name after the code runs.
    pub fn pull(mut self, name: impl Into<String>) -> Self {
        self.task.pull.push(name.into());
        self
    }

    pub fn pull_all<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task.pull.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn clear_before(mut self, clear: bool) -> Self {
        self.task.clear_before = clear;
        self
    }

    pub fn clear_after(mut self, clear: bool) -> Self {
        self.task.clear_after = clear;
        self
    }

    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.task.dependency = dependency;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.task.retries = retries;
        self
    }

    /// Task substituted for this one when it fails for good.
    pub fn recovery(mut self, task: Task) -> Self {
        self.task.recovery = Some(Arc::new(task));
        self
    }

    pub fn recovery_mode(mut self, mode: RecoveryMode) -> Self {
        self.task.recovery_mode = mode;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}
