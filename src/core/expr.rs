/// Clause expression evaluator — a small operator-precedence calculator
/// over numbers, strings, and state lookups.

use thiserror::Error;

use crate::core::state::{compare, state_value, Cmp, StateMap, Value};

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("unbalanced parentheses in expression `{0}`")]
    UnbalancedParens(String),
    #[error("malformed expression `{expr}`: {detail}")]
    Malformed { expr: String, detail: String },
    #[error("type mismatch in expression `{expr}`: {detail}")]
    TypeMismatch { expr: String, detail: String },
    #[error("division by zero in expression `{0}`")]
    DivisionByZero(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    LParen,
    Or,
    And,
    Compare(Cmp),
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Not,
}

fn precedence(op: Op) -> u8 {
    match op {
        Op::LParen => 99,
        Op::Not => 8,
        Op::Neg => 7,
        Op::Pow => 6,
        Op::Mul | Op::Div => 5,
        Op::Add | Op::Sub => 3,
        Op::Compare(_) => 2,
        Op::And => 1,
        Op::Or => 0,
    }
}

fn is_op_char(c: char) -> bool {
    matches!(
        c,
        ')' | '^' | '*' | '/' | '+' | '-' | '=' | '!' | '<' | '>' | '&' | '|'
    )
}

fn is_cmp_char(c: char) -> bool {
    matches!(c, '=' | '!' | '<' | '>' | '&' | '|')
}

/// Evaluate an expression against a state map.
///
/// Numeric literals, double-quoted strings, and bare identifiers (resolved
/// through `state`, defaulting to 0) combine through `^ * / + -`, the six
/// comparisons, `&&`/`||`, unary minus and not, and parentheses. Spaces
/// outside quotes are ignored. The final result is floored toward negative
/// infinity unless it is a string.
pub fn evaluate(expression: &str, state: &StateMap) -> Result<Value, ExprError> {
    let wrapped: Vec<char> = format!("({})", expression).chars().collect();
    let mut ops: Vec<Op> = Vec::new();
    let mut vals: Vec<Value> = Vec::new();
    let mut token = String::new();
    let mut quoted = false;
    // Tracks whether an operand immediately precedes the cursor, which is
    // what decides unary versus binary `-` and `!`.
    let mut prev_was_value = false;

    let mut i = 0;
    while i < wrapped.len() {
        let c = wrapped[i];

        if c == '"' {
            quoted = !quoted;
            token.push(c);
            i += 1;
            continue;
        }
        if quoted {
            token.push(c);
            i += 1;
            continue;
        }
        if c == ' ' {
            i += 1;
            continue;
        }
        if c == '(' {
            ops.push(Op::LParen);
            prev_was_value = false;
            i += 1;
            continue;
        }
        if !is_op_char(c) {
            token.push(c);
            i += 1;
            continue;
        }

        let unary = token.is_empty() && !prev_was_value;
        if !token.is_empty() {
            vals.push(resolve_token(&token, state, expression)?);
            token.clear();
            prev_was_value = true;
        }

        if c == ')' {
            loop {
                match ops.pop() {
                    Some(Op::LParen) => break,
                    Some(op) => apply_op(op, &mut vals, expression)?,
                    None => return Err(ExprError::UnbalancedParens(expression.to_string())),
                }
            }
            prev_was_value = true;
            i += 1;
            continue;
        }

        let mut consumed = 1;
        let op = if c == '-' && unary {
            Op::Neg
        } else if c == '!' && unary {
            Op::Not
        } else if is_cmp_char(c) && i + 1 < wrapped.len() && is_cmp_char(wrapped[i + 1]) {
            consumed = 2;
            match (c, wrapped[i + 1]) {
                ('=', '=') => Op::Compare(Cmp::Eq),
                ('!', '=') => Op::Compare(Cmp::Ne),
                ('<', '=') => Op::Compare(Cmp::Le),
                ('>', '=') => Op::Compare(Cmp::Ge),
                ('&', '&') => Op::And,
                ('|', '|') => Op::Or,
                (a, b) => {
                    return Err(ExprError::Malformed {
                        expr: expression.to_string(),
                        detail: format!("unrecognized operator `{}{}`", a, b),
                    })
                }
            }
        } else {
            match c {
                '^' => Op::Pow,
                '*' => Op::Mul,
                '/' => Op::Div,
                '+' => Op::Add,
                '-' => Op::Sub,
                '<' => Op::Compare(Cmp::Lt),
                '>' => Op::Compare(Cmp::Gt),
                other => {
                    return Err(ExprError::Malformed {
                        expr: expression.to_string(),
                        detail: format!("unrecognized operator `{}`", other),
                    })
                }
            }
        };

        while let Some(&top) = ops.last() {
            if top == Op::LParen || precedence(op) > precedence(top) {
                break;
            }
            let top = ops.pop().expect("just peeked");
            apply_op(top, &mut vals, expression)?;
        }
        ops.push(op);
        prev_was_value = false;
        i += consumed;
    }

    if quoted {
        return Err(ExprError::Malformed {
            expr: expression.to_string(),
            detail: "unterminated string literal".to_string(),
        });
    }
    if !ops.is_empty() {
        if ops.contains(&Op::LParen) {
            return Err(ExprError::UnbalancedParens(expression.to_string()));
        }
        return Err(ExprError::Malformed {
            expr: expression.to_string(),
            detail: format!("{} operators left unreduced", ops.len()),
        });
    }
    if vals.len() != 1 {
        return Err(ExprError::Malformed {
            expr: expression.to_string(),
            detail: format!("expected one result value, found {}", vals.len()),
        });
    }

    Ok(vals.pop().expect("just checked").floored())
}

fn resolve_token(token: &str, state: &StateMap, expr: &str) -> Result<Value, ExprError> {
    if let Some(inner) = token.strip_prefix('"') {
        return match inner.strip_suffix('"') {
            Some(body) => Ok(Value::Str(body.to_string())),
            None => Err(ExprError::Malformed {
                expr: expr.to_string(),
                detail: format!("mismatched quotes in `{}`", token),
            }),
        };
    }
    if let Ok(n) = token.parse::<f64>() {
        return Ok(Value::Num(n));
    }
    Ok(state_value(state, token))
}

fn apply_op(op: Op, vals: &mut Vec<Value>, expr: &str) -> Result<(), ExprError> {
    let missing = || ExprError::Malformed {
        expr: expr.to_string(),
        detail: "operator with too few operands".to_string(),
    };

    match op {
        Op::Neg => {
            let v = vals.pop().ok_or_else(missing)?;
            match v {
                Value::Num(n) => vals.push(Value::Num(-n)),
                Value::Str(s) => {
                    return Err(ExprError::TypeMismatch {
                        expr: expr.to_string(),
                        detail: format!("cannot negate string `{}`", s),
                    })
                }
            }
        }
        Op::Not => {
            let v = vals.pop().ok_or_else(missing)?;
            vals.push(Value::Num(if v.truthy() { 0.0 } else { 1.0 }));
        }
        _ => {
            let rhs = vals.pop().ok_or_else(missing)?;
            let lhs = vals.pop().ok_or_else(missing)?;
            vals.push(apply_binary(op, lhs, rhs, expr)?);
        }
    }
    Ok(())
}

fn apply_binary(op: Op, lhs: Value, rhs: Value, expr: &str) -> Result<Value, ExprError> {
    // Coerce toward strings: a number compared with or added to a string is
    // floored and stringified first.
    let (lhs, rhs) = match (lhs, rhs) {
        (Value::Num(n), Value::Str(s)) => (
            Value::Str(Value::Num(n).floored().to_string()),
            Value::Str(s),
        ),
        (Value::Str(s), Value::Num(n)) => (
            Value::Str(s),
            Value::Str(Value::Num(n).floored().to_string()),
        ),
        pair => pair,
    };

    let type_err = |detail: String| ExprError::TypeMismatch {
        expr: expr.to_string(),
        detail,
    };

    Ok(match op {
        Op::Add => match (lhs, rhs) {
            (Value::Num(a), Value::Num(b)) => Value::Num(a + b),
            (Value::Str(a), Value::Str(b)) => Value::Str(a + &b),
            _ => unreachable!("coercion leaves both operands the same kind"),
        },
        Op::Sub | Op::Mul | Op::Div | Op::Pow => {
            let (a, b) = match (&lhs, &rhs) {
                (Value::Num(a), Value::Num(b)) => (*a, *b),
                _ => {
                    return Err(type_err(format!(
                        "`{}` requires numeric operands",
                        match op {
                            Op::Sub => "-",
                            Op::Mul => "*",
                            Op::Div => "/",
                            _ => "^",
                        }
                    )))
                }
            };
            match op {
                Op::Sub => Value::Num(a - b),
                Op::Mul => Value::Num(a * b),
                Op::Pow => Value::Num(a.powf(b)),
                _ => {
                    if b == 0.0 {
                        return Err(ExprError::DivisionByZero(expr.to_string()));
                    }
                    Value::Num(a / b)
                }
            }
        }
        Op::Compare(cmp) => Value::Num(if compare(&lhs, cmp, &rhs) { 1.0 } else { 0.0 }),
        Op::And => {
            if !lhs.truthy() {
                lhs
            } else {
                rhs
            }
        }
        Op::Or => {
            if lhs.truthy() {
                lhs
            } else {
                rhs
            }
        }
        Op::LParen | Op::Neg | Op::Not => unreachable!("handled before binary application"),
    })
}
