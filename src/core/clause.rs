/// State clauses — the five `%...%` forms attached to weights, values,
/// and template text, parsed into a tagged variant and applied against
/// session state.

use thiserror::Error;

use crate::core::expr::{self, ExprError};
use crate::core::state::{compare, state_value, Cmp, StateMap, Value};

#[derive(Debug, Error)]
pub enum ClauseError {
    #[error("clause `{0}` does not match any clause form")]
    Malformed(String),
    #[error("clause `{0}` is not a value modification")]
    NotValueModification(String),
    #[error("clause `{0}` is not a state modification")]
    NotStateModification(String),
    #[error("clause `{0}` is not a state interpolation")]
    NotInterpolation(String),
    #[error("modification `{op}` in clause `{clause}` requires numeric operands")]
    TypeMismatch { clause: String, op: String },
    #[error("division by zero in clause `{0}`")]
    DivisionByZero(String),
    #[error(transparent)]
    Expr(#[from] ExprError),
}

/// The modification operator of a value or state clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// A comparison guard: `<lhs><cmp><rhs>`, both sides full expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub lhs: String,
    pub cmp: Cmp,
    pub rhs: String,
}

impl Condition {
    pub fn holds(&self, state: &StateMap) -> Result<bool, ClauseError> {
        let lhs = expr::evaluate(&self.lhs, state)?;
        let rhs = expr::evaluate(&self.rhs, state)?;
        Ok(compare(&lhs, self.cmp, &rhs))
    }
}

/// What a state-modification clause does to its target key.
#[derive(Debug, Clone, PartialEq)]
pub enum StateAction {
    /// Apply an operator with an expression operand.
    Apply(ModOp, String),
    /// `:@` — snapshot the currently expanded text into the key.
    Snapshot,
}

/// A parsed clause. The leading space and the presence of `->` and `:`
/// partition the five forms, so the first structural match wins.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    ValueMod { op: ModOp, operand: String },
    ConditionalValueMod { cond: Condition, op: ModOp, operand: String },
    StateMod { name: String, action: StateAction },
    ConditionalStateMod { cond: Condition, name: String, action: StateAction },
    Interpolation { cond: Option<Condition>, name: String },
}

/// Parse a raw clause, delimiters included. State-modification forms carry
/// their one leading literal space.
pub fn parse(raw: &str) -> Result<Clause, ClauseError> {
    let malformed = || ClauseError::Malformed(raw.to_string());

    let (state_family, body) = if let Some(rest) = raw.strip_prefix(" %") {
        (true, rest)
    } else if let Some(rest) = raw.strip_prefix('%') {
        (false, rest)
    } else {
        return Err(malformed());
    };
    let body = body.strip_suffix('%').ok_or_else(malformed)?;
    if body.is_empty() || body.contains('%') {
        return Err(malformed());
    }

    let (cond, action) = match find_arrow(body) {
        Some(i) => (Some(parse_condition(&body[..i], raw)?), &body[i + 2..]),
        None => (None, body),
    };

    if state_family {
        let (name, rest) = action.split_once(':').ok_or_else(malformed)?;
        if !is_identifier(name) {
            return Err(malformed());
        }
        let state_action = if rest == "@" {
            StateAction::Snapshot
        } else {
            let (op, operand) = parse_mod_op(rest).ok_or_else(malformed)?;
            StateAction::Apply(op, operand.to_string())
        };
        return Ok(match cond {
            Some(cond) => Clause::ConditionalStateMod {
                cond,
                name: name.to_string(),
                action: state_action,
            },
            None => Clause::StateMod {
                name: name.to_string(),
                action: state_action,
            },
        });
    }

    if let Some((op, operand)) = parse_mod_op(action) {
        return Ok(match cond {
            Some(cond) => Clause::ConditionalValueMod {
                cond,
                op,
                operand: operand.to_string(),
            },
            None => Clause::ValueMod {
                op,
                operand: operand.to_string(),
            },
        });
    }

    if is_identifier(action) {
        return Ok(Clause::Interpolation {
            cond,
            name: action.to_string(),
        });
    }

    Err(malformed())
}

/// Recompute a base value through a value-modification clause.
///
/// A failed condition passes the base through untouched. Numeric results
/// are floored toward negative infinity.
pub fn evaluate_value_modification(
    raw: &str,
    base: Value,
    state: &StateMap,
) -> Result<Value, ClauseError> {
    match parse(raw)? {
        Clause::ValueMod { op, operand } => apply_mod(raw, base, op, &operand, state),
        Clause::ConditionalValueMod { cond, op, operand } => {
            if cond.holds(state)? {
                apply_mod(raw, base, op, &operand, state)
            } else {
                Ok(base)
            }
        }
        _ => Err(ClauseError::NotValueModification(raw.to_string())),
    }
}

/// Evaluate a state-modification clause, returning the target key and its
/// new value. `expansion` feeds the `:@` snapshot form.
pub fn evaluate_state_modification(
    raw: &str,
    expansion: &str,
    state: &StateMap,
) -> Result<(String, Value), ClauseError> {
    match parse(raw)? {
        c @ (Clause::StateMod { .. } | Clause::ConditionalStateMod { .. }) => {
            apply_state_modification(&c, raw, expansion, state)
        }
        _ => Err(ClauseError::NotStateModification(raw.to_string())),
    }
}

/// Apply an already-parsed state modification.
pub fn apply_state_modification(
    clause: &Clause,
    raw: &str,
    expansion: &str,
    state: &StateMap,
) -> Result<(String, Value), ClauseError> {
    let (cond, name, action) = match clause {
        Clause::StateMod { name, action } => (None, name, action),
        Clause::ConditionalStateMod { cond, name, action } => (Some(cond), name, action),
        _ => return Err(ClauseError::NotStateModification(raw.to_string())),
    };

    let target = state_value(state, name);
    if let Some(cond) = cond {
        if !cond.holds(state)? {
            return Ok((name.clone(), target));
        }
    }

    let value = match action {
        StateAction::Snapshot => Value::Str(expansion.to_string()),
        StateAction::Apply(op, operand) => apply_mod(raw, target, *op, operand, state)?,
    };
    Ok((name.clone(), value))
}

/// Evaluate a state-interpolation clause. `None` is the distinct
/// "no value" outcome that deletes an enclosing brace group.
pub fn evaluate_state_interpolation(
    raw: &str,
    state: &StateMap,
) -> Result<Option<Value>, ClauseError> {
    match parse(raw)? {
        Clause::Interpolation { cond: None, name } => Ok(state.get(&name).cloned()),
        Clause::Interpolation {
            cond: Some(cond),
            name,
        } => {
            if cond.holds(state)? {
                Ok(Some(state_value(state, &name)))
            } else {
                Ok(None)
            }
        }
        _ => Err(ClauseError::NotInterpolation(raw.to_string())),
    }
}

fn apply_mod(
    raw: &str,
    base: Value,
    op: ModOp,
    operand: &str,
    state: &StateMap,
) -> Result<Value, ClauseError> {
    let rhs = expr::evaluate(operand, state)?;

    if op == ModOp::Assign {
        return Ok(rhs.floored());
    }

    // `+` concatenates when either side is a string.
    if op == ModOp::Add {
        if let (Value::Str(_), _) | (_, Value::Str(_)) = (&base, &rhs) {
            let a = base.floored().to_string();
            let b = rhs.floored().to_string();
            return Ok(Value::Str(a + &b));
        }
    }

    let (a, b) = match (base.as_number(), rhs.as_number()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(ClauseError::TypeMismatch {
                clause: raw.to_string(),
                op: mod_op_symbol(op).to_string(),
            })
        }
    };

    let result = match op {
        ModOp::Add => a + b,
        ModOp::Sub => a - b,
        ModOp::Mul => a * b,
        ModOp::Pow => a.powf(b),
        ModOp::Div => {
            if b == 0.0 {
                return Err(ClauseError::DivisionByZero(raw.to_string()));
            }
            a / b
        }
        ModOp::Assign => unreachable!("handled above"),
    };
    Ok(Value::Num(result.floor()))
}

fn mod_op_symbol(op: ModOp) -> &'static str {
    match op {
        ModOp::Assign => "=",
        ModOp::Add => "+=",
        ModOp::Sub => "-=",
        ModOp::Mul => "*=",
        ModOp::Div => "/=",
        ModOp::Pow => "^=",
    }
}

fn parse_mod_op(s: &str) -> Option<(ModOp, &str)> {
    if let Some(rest) = s.strip_prefix("+=") {
        return Some((ModOp::Add, rest));
    }
    if let Some(rest) = s.strip_prefix("-=") {
        return Some((ModOp::Sub, rest));
    }
    if let Some(rest) = s.strip_prefix("*=") {
        return Some((ModOp::Mul, rest));
    }
    if let Some(rest) = s.strip_prefix("/=") {
        return Some((ModOp::Div, rest));
    }
    if let Some(rest) = s.strip_prefix("^=") {
        return Some((ModOp::Pow, rest));
    }
    if let Some(rest) = s.strip_prefix('=') {
        if rest.is_empty() {
            return None;
        }
        return Some((ModOp::Assign, rest));
    }
    None
}

/// Find the top-level `->` separating a condition from its action,
/// skipping quoted spans.
fn find_arrow(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut quoted = false;
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'"' {
            quoted = !quoted;
        } else if !quoted && bytes[i] == b'-' && bytes[i + 1] == b'>' {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn parse_condition(s: &str, raw: &str) -> Result<Condition, ClauseError> {
    let bytes = s.as_bytes();
    let mut quoted = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'"' {
            quoted = !quoted;
            i += 1;
            continue;
        }
        if quoted {
            i += 1;
            continue;
        }
        let two = if i + 1 < bytes.len() {
            match (b, bytes[i + 1]) {
                (b'=', b'=') => Some(Cmp::Eq),
                (b'!', b'=') => Some(Cmp::Ne),
                (b'<', b'=') => Some(Cmp::Le),
                (b'>', b'=') => Some(Cmp::Ge),
                _ => None,
            }
        } else {
            None
        };
        if let Some(cmp) = two {
            return Ok(Condition {
                lhs: s[..i].to_string(),
                cmp,
                rhs: s[i + 2..].to_string(),
            });
        }
        if b == b'<' || b == b'>' {
            return Ok(Condition {
                lhs: s[..i].to_string(),
                cmp: if b == b'<' { Cmp::Lt } else { Cmp::Gt },
                rhs: s[i + 1..].to_string(),
            });
        }
        i += 1;
    }
    Err(ClauseError::Malformed(raw.to_string()))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
