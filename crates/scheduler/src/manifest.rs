//! TOML task manifests for the controller binary.
//!
//! ```toml
//! [[task]]
//! name = "square"
//! code = "x = y"
//! push = { y = 16 }
//! pull = ["x"]
//! retries = 2
//! dependency = { constraints = [{ key = "rank", value = 1, op = ">=" }] }
//!
//! [task.recovery]
//! code = "x = 0"
//! pull = ["x"]
//! ```

use std::path::Path;

use serde::Deserialize;

use taskhub_core::{
    Constraint, Dependency, KernelError, Namespace, Properties, RecoveryMode, Task,
};

/// A parsed manifest: tasks in declaration order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskSpec>,
}

/// Declarative form of a [`Task`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskSpec {
    /// Label used in the controller's output.
    #[serde(default)]
    pub name: Option<String>,
    pub code: String,
    #[serde(default)]
    pub push: Namespace,
    #[serde(default)]
    pub pull: Vec<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub clear_before: bool,
    #[serde(default)]
    pub clear_after: bool,
    #[serde(default)]
    pub recovery_mode: RecoveryMode,
    #[serde(default)]
    pub dependency: Option<DependencySpec>,
    #[serde(default)]
    pub recovery: Option<Box<TaskSpec>>,
}

/// Dependency forms accepted in a manifest. All given forms must hold.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DependencySpec {
    #[serde(default)]
    pub exact: Properties,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub expr: Option<String>,
}

impl DependencySpec {
    pub fn to_dependency(&self) -> Result<Dependency, KernelError> {
        let mut dependency = Dependency::Exact(self.exact.clone())
            .combine(Dependency::Constraints(self.constraints.clone()));
        if let Some(expr) = &self.expr {
            dependency = dependency.combine(Dependency::expression(expr)?);
        }
        Ok(dependency)
    }
}

impl TaskSpec {
    /// Build the task, recursing into the recovery chain.
    pub fn to_task(&self) -> Result<Task, KernelError> {
        if self.code.trim().is_empty() {
            return Err(KernelError::InvalidTask(format!(
                "task {} has no code",
                self.name.as_deref().unwrap_or("<unnamed>")
            )));
        }
        let mut builder = Task::builder(self.code.clone())
            .push_namespace(self.push.clone())
            .pull_all(self.pull.iter().cloned())
            .retries(self.retries)
            .clear_before(self.clear_before)
            .clear_after(self.clear_after)
            .recovery_mode(self.recovery_mode);
        if let Some(dependency) = &self.dependency {
            builder = builder.dependency(dependency.to_dependency()?);
        }
        if let Some(recovery) = &self.recovery {
            builder = builder.recovery(recovery.to_task()?);
        }
        Ok(builder.build())
    }
}

impl Manifest {
    pub fn from_toml(source: &str) -> Result<Self, KernelError> {
        toml::from_str(source).map_err(|e| KernelError::Config(format!("invalid manifest: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KernelError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            KernelError::Config(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        Self::from_toml(&source)
    }

    /// Label and task for each entry, in declaration order.
    pub fn tasks(&self) -> Result<Vec<(String, Task)>, KernelError> {
        self.tasks
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let name = spec.name.clone().unwrap_or_else(|| format!("task-{i}"));
                Ok((name, spec.to_task()?))
            })
            .collect()
    }
}
