//! In-process worker running a tiny line-oriented script language.
//!
//! Statements are separated by newlines or `;`:
//!
//! | statement            | effect                                            |
//! |----------------------|---------------------------------------------------|
//! | `name = <json>`      | bind a JSON literal                               |
//! | `name = other`       | copy another binding                              |
//! | `del name`           | remove a binding                                  |
//! | `print <name/text>`  | write a binding (or the raw text) to stdout       |
//! | `eprint <text>`      | write text to stderr                              |
//! | `raise [message]`    | fail with `RuntimeError`                          |
//! | `sleep <ms>`         | wait; interruptible                               |
//! | `pass`, `# ...`      | nothing                                           |
//!
//! Anything else fails with `SyntaxError`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::trace;

use taskhub_core::sync::lock;
use taskhub_core::{Execution, Namespace, RemoteFailure};

use crate::error::WorkerError;
use crate::traits::Worker;

pub struct LocalWorker {
    name: String,
    namespace: Mutex<Namespace>,
    interrupt: Notify,
    executions: AtomicU64,
    disconnected: AtomicBool,
}

impl LocalWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Mutex::new(Namespace::new()),
            interrupt: Notify::new(),
            executions: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Number of `execute` calls received so far.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Current value of a binding.
    pub fn get(&self, name: &str) -> Option<Value> {
        lock(&self.namespace).get(name).cloned()
    }

    /// Simulate a lost connection: every later call fails with `Disconnected`.
    pub fn sever(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.interrupt.notify_waiters();
    }

    fn ensure_connected(&self) -> Result<(), WorkerError> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(WorkerError::Disconnected(format!("{} is gone", self.name)))
        } else {
            Ok(())
        }
    }

    async fn run_statement(&self, stmt: &str, out: &mut Execution) -> Result<(), RemoteFailure> {
        let (head, rest) = match stmt.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (stmt, ""),
        };

        match head {
            "pass" if rest.is_empty() => Ok(()),
            "del" if is_identifier(rest) => {
                let removed = lock(&self.namespace).shift_remove(rest);
                removed.map(|_| ()).ok_or_else(|| name_error(rest))
            }
            "print" => {
                let bound = lock(&self.namespace).get(rest).cloned();
                let text = match bound {
                    Some(Value::String(s)) => s,
                    Some(v) => v.to_string(),
                    None => rest.to_string(),
                };
                out.stdout.push_str(&text);
                out.stdout.push('\n');
                Ok(())
            }
            "eprint" => {
                out.stderr.push_str(rest);
                out.stderr.push('\n');
                Ok(())
            }
            "raise" => Err(RemoteFailure::new("RuntimeError", rest)),
            "sleep" => {
                let ms: u64 = rest
                    .parse()
                    .map_err(|_| syntax_error(stmt))?;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
                    _ = self.interrupt.notified() => {
                        Err(RemoteFailure::new("KeyboardInterrupt", ""))
                    }
                }
            }
            _ => self.assign(stmt),
        }
    }

    fn assign(&self, stmt: &str) -> Result<(), RemoteFailure> {
        let Some((target, expr)) = stmt.split_once('=') else {
            return Err(syntax_error(stmt));
        };
        let (target, expr) = (target.trim(), expr.trim());
        if !is_identifier(target) || expr.is_empty() {
            return Err(syntax_error(stmt));
        }

        let mut namespace = lock(&self.namespace);
        let value = match serde_json::from_str::<Value>(expr) {
            Ok(v) => v,
            Err(_) if is_identifier(expr) => namespace
                .get(expr)
                .cloned()
                .ok_or_else(|| name_error(expr))?,
            Err(_) => return Err(syntax_error(stmt)),
        };
        namespace.insert(target.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl Worker for LocalWorker {
    async fn execute(&self, code: &str) -> Result<Execution, WorkerError> {
        self.ensure_connected()?;
        self.executions.fetch_add(1, Ordering::SeqCst);
        trace!(worker = %self.name, code, "executing");

        let mut out = Execution::default();
        for stmt in split_statements(code) {
            let result = self.run_statement(stmt, &mut out).await;
            // A sever during a sleep surfaces as a lost connection, not a result.
            self.ensure_connected()?;
            if let Err(failure) = result {
                out.error = Some(failure);
                break;
            }
        }
        Ok(out)
    }

    async fn push(&self, namespace: &Namespace) -> Result<(), WorkerError> {
        self.ensure_connected()?;
        let mut ns = lock(&self.namespace);
        for (name, value) in namespace {
            ns.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    async fn pull(&self, names: &[String]) -> Result<Namespace, WorkerError> {
        self.ensure_connected()?;
        let ns = lock(&self.namespace);
        names
            .iter()
            .map(|name| {
                ns.get(name)
                    .map(|v| (name.clone(), v.clone()))
                    .ok_or_else(|| WorkerError::Remote(name_error(name)))
            })
            .collect()
    }

    async fn reset(&self) -> Result<(), WorkerError> {
        self.ensure_connected()?;
        lock(&self.namespace).clear();
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), WorkerError> {
        self.ensure_connected()?;
        self.interrupt.notify_waiters();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Split on newlines and on `;` outside double-quoted strings. Drops blanks
/// and comments.
fn split_statements(code: &str) -> Vec<&str> {
    let mut out = Vec::new();
    for line in code.lines() {
        let mut start = 0;
        let mut in_string = false;
        let mut escaped = false;
        for (i, c) in line.char_indices() {
            match c {
                _ if escaped => escaped = false,
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                ';' if !in_string => {
                    out.push(&line[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
        }
        out.push(&line[start..]);
    }
    out.into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with('#'))
        .collect()
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !matches!(s, "true" | "false" | "null")
}

fn name_error(name: &str) -> RemoteFailure {
    RemoteFailure::new("NameError", format!("name '{name}' is not defined"))
}

fn syntax_error(stmt: &str) -> RemoteFailure {
    RemoteFailure::new("SyntaxError", format!("invalid statement: {stmt}"))
}
