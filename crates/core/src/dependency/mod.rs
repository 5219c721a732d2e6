//! Engine eligibility predicates.
//!
//! A [`Dependency`] decides whether an engine, described by its property map,
//! may run a task. Three equivalent construction forms are supported:
//!
//! 1. [`Dependency::exact`]: every reference key must be present and equal.
//! 2. [`Dependency::constraints`]: `(key, reference, operator)` triples, ANDed.
//! 3. [`Dependency::predicate`]: an arbitrary boolean callback.
//!
//! [`Dependency::expression`] adds a parsed, side-effect free expression form.
//! A constraint on a key that is absent from the properties is always false.

mod expr;
mod ops;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use expr::Expression;
pub use ops::Operator;

use crate::error::KernelError;
use crate::value::Properties;

/// Boolean callback over an engine's properties.
pub type PredicateFn = dyn Fn(&Properties) -> bool + Send + Sync;

/// One `(key, reference, operator)` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub key: String,
    pub value: Value,
    pub op: Operator,
}

impl Constraint {
    pub fn new(key: impl Into<String>, value: Value, op: Operator) -> Self {
        Self {
            key: key.into(),
            value,
            op,
        }
    }

    pub fn test(&self, properties: &Properties) -> bool {
        properties
            .get(&self.key)
            .is_some_and(|actual| self.op.apply(actual, &self.value))
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.key, self.op, self.value)
    }
}

#[derive(Clone)]
pub enum Dependency {
    /// Every key must be present with an equal value.
    Exact(Properties),
    /// All constraints must hold.
    Constraints(Vec<Constraint>),
    /// Caller-supplied test.
    Predicate(Arc<PredicateFn>),
    /// Parsed sandboxed expression.
    Expression(Expression),
    /// Logical AND of several dependencies.
    All(Vec<Dependency>),
}

impl Dependency {
    /// The empty dependency: satisfied by every engine.
    pub fn always() -> Self {
        Self::Constraints(Vec::new())
    }

    pub fn exact<K, I>(reference: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Exact(reference.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn constraints<K, I>(triples: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value, Operator)>,
    {
        Self::Constraints(
            triples
                .into_iter()
                .map(|(k, v, op)| Constraint::new(k, v, op))
                .collect(),
        )
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Properties) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Parse a sandboxed boolean expression, e.g. `rank >= 2 and 'gpu' in tags`.
    pub fn expression(source: &str) -> Result<Self, KernelError> {
        Expression::parse(source).map(Self::Expression)
    }

    /// Evaluate against an engine's properties.
    pub fn test(&self, properties: &Properties) -> bool {
        match self {
            Self::Exact(reference) => reference.iter().all(|(key, expected)| {
                properties
                    .get(key)
                    .is_some_and(|actual| Operator::Eq.apply(actual, expected))
            }),
            Self::Constraints(constraints) => constraints.iter().all(|c| c.test(properties)),
            Self::Predicate(f) => f(properties),
            Self::Expression(e) => e.evaluate(properties),
            Self::All(parts) => parts.iter().all(|d| d.test(properties)),
        }
    }

    /// Logical AND of `self` and `other`.
    pub fn combine(self, other: Dependency) -> Dependency {
        let mut parts = Vec::new();
        for dep in [self, other] {
            match dep {
                Self::All(inner) => parts.extend(inner),
                d if d.is_empty() => {}
                d => parts.push(d),
            }
        }
        match parts.len() {
            0 => Self::always(),
            1 => parts.remove(0),
            _ => Self::All(parts),
        }
    }

    /// Whether the dependency was constructed without any constraint.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Exact(reference) => reference.is_empty(),
            Self::Constraints(constraints) => constraints.is_empty(),
            Self::Predicate(_) | Self::Expression(_) => false,
            Self::All(parts) => parts.iter().all(Dependency::is_empty),
        }
    }
}

impl Default for Dependency {
    fn default() -> Self {
        Self::always()
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(reference) => f.debug_tuple("Exact").field(reference).finish(),
            Self::Constraints(c) => f.debug_tuple("Constraints").field(c).finish(),
            Self::Predicate(_) => f.write_str("Predicate(<fn>)"),
            Self::Expression(e) => f.debug_tuple("Expression").field(&e.source()).finish(),
            Self::All(parts) => f.debug_tuple("All").field(parts).finish(),
        }
    }
}
