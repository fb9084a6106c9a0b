/// Session state — the two-kinded value model and the mutable state map.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A state value: a number or a string.
///
/// Numbers are kept as `f64` internally but are floored toward negative
/// infinity at evaluation boundaries, so stored values are almost always
/// integral. Integral numbers display without a fractional part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Num(f64),
    Str(String),
}

impl Value {
    /// Truthiness for `&&` / `||` and unary not: zero numbers and empty
    /// strings are falsy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(_) => None,
        }
    }

    /// Truncate toward negative infinity; strings pass through untouched.
    pub fn floored(self) -> Value {
        match self {
            Value::Num(n) => Value::Num(n.floor()),
            s => s,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < i64::MAX as f64 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Num(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_string())
    }
}

/// Mutable per-session state, keyed by identifier.
pub type StateMap = FxHashMap<String, Value>;

/// Read a state variable, defaulting missing keys to `0`.
///
/// A missing key is logged as a possible authoring error (a misspelled
/// identifier reads as zero instead of failing).
pub fn state_value(state: &StateMap, name: &str) -> Value {
    match state.get(name) {
        Some(v) => v.clone(),
        None => {
            log::info!(
                "state key `{}` is not set; defaulting to 0 (intentional, or a misspelling?)",
                name
            );
            Value::Num(0.0)
        }
    }
}

/// A comparison operator shared by the expression evaluator and clause
/// conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Compare two values with number-toward-string coercion: when exactly one
/// side is a string, the numeric side is floored and compared textually.
pub fn compare(lhs: &Value, cmp: Cmp, rhs: &Value) -> bool {
    use std::cmp::Ordering;

    let ord = match (lhs, rhs) {
        (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::Num(_), Value::Str(b)) => {
            Some(lhs.clone().floored().to_string().as_str().cmp(b.as_str()))
        }
        (Value::Str(a), Value::Num(_)) => {
            Some(a.as_str().cmp(rhs.clone().floored().to_string().as_str()))
        }
    };

    match ord {
        None => cmp == Cmp::Ne,
        Some(Ordering::Equal) => matches!(cmp, Cmp::Eq | Cmp::Le | Cmp::Ge),
        Some(Ordering::Less) => matches!(cmp, Cmp::Ne | Cmp::Lt | Cmp::Le),
        Some(Ordering::Greater) => matches!(cmp, Cmp::Ne | Cmp::Gt | Cmp::Ge),
    }
}
