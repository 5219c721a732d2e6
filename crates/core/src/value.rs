use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::EngineId;

/// Ordered name → value mapping pushed into, or pulled from, a worker namespace.
pub type Namespace = IndexMap<String, Value>;

/// Engine metadata (rank, capabilities, tags) used for dependency matching.
pub type Properties = BTreeMap<String, Value>;

/// Captured error raised by worker-side code. Opaque to the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// Error class name as reported by the worker (e.g. `RuntimeError`).
    pub ename: String,
    /// Error message.
    pub evalue: String,
    /// Formatted traceback lines, if the worker provides them.
    #[serde(default)]
    pub traceback: Vec<String>,
}

impl RemoteFailure {
    pub fn new(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Self {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: Vec::new(),
        }
    }

    pub fn with_traceback(mut self, traceback: Vec<String>) -> Self {
        self.traceback = traceback;
        self
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.ename, self.evalue)
    }
}

/// Output of one `execute(code)` call on a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<RemoteFailure>,
}

/// Successful outcome of a command, and of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Engine that produced the reply.
    pub engine: EngineId,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Values pulled from the worker namespace, in request order.
    #[serde(default)]
    pub values: Namespace,
}

impl Reply {
    pub fn empty(engine: EngineId) -> Self {
        Self {
            engine,
            stdout: String::new(),
            stderr: String::new(),
            values: Namespace::new(),
        }
    }

    /// Look up a pulled value by name.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}
