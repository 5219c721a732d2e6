use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KernelError;

/// Comparison operator of a `(key, reference, operator)` constraint.
///
/// The property value is always the left operand: `properties[key] <op> reference`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }

    /// Apply the operator to a present property value.
    pub fn apply(&self, actual: &Value, reference: &Value) -> bool {
        match self {
            Self::Lt => ordering(actual, reference) == Some(Ordering::Less),
            Self::Le => matches!(
                ordering(actual, reference),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::Gt => ordering(actual, reference) == Some(Ordering::Greater),
            Self::Ge => matches!(
                ordering(actual, reference),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Eq => values_equal(actual, reference),
            Self::In => contains(reference, actual).unwrap_or(false),
            Self::NotIn => contains(reference, actual).map(|c| !c).unwrap_or(false),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.as_str() {
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "==" => Ok(Self::Eq),
            "in" => Ok(Self::In),
            "not in" => Ok(Self::NotIn),
            other => Err(KernelError::InvalidDependency(format!(
                "unknown operator '{other}'"
            ))),
        }
    }
}

/// Equality with numeric normalization (`5 == 5.0`).
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        _ => a == b,
    }
}

/// Total order between values of the same kind; `None` across kinds.
pub(crate) fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys) {
                match ordering(x, y)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(xs.len().cmp(&ys.len()))
        }
        _ => None,
    }
}

/// Membership test; `None` when the container kind does not support `in`.
pub(crate) fn contains(container: &Value, item: &Value) -> Option<bool> {
    match container {
        Value::Array(items) => Some(items.iter().any(|v| values_equal(v, item))),
        Value::String(haystack) => item.as_str().map(|needle| haystack.contains(needle)),
        Value::Object(map) => item.as_str().map(|key| map.contains_key(key)),
        _ => None,
    }
}
