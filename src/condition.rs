//! Condition evaluation for wait tasks
//!
//! Conditions are small boolean expressions over the signal context:
//!
//! ```text
//! signal.payload.approved == true
//! signal.payload.count >= 3 && task.status != "failed"
//! processor.output.score > 0.5 || signal.payload.override
//! ```
//!
//! Operands are dotted paths into the context or literals (`true`, `false`,
//! `null`, numbers, quoted strings). A bare path is truthy-tested. `&&`
//! binds tighter than `||`. Anything the grammar does not cover is a
//! `CONDITION_EVAL_ERROR`, which fails the waiting task (§ error policy).

use serde_json::Value;

use crate::error::OrdoError;
use crate::template::is_truthy;
use crate::util::jsonpath;

/// Evaluate a condition string against a context
pub fn evaluate(condition: &str, context: &Value) -> Result<bool, OrdoError> {
    let condition = condition.trim();
    if condition.is_empty() {
        return Err(OrdoError::ConditionEval("empty condition".into()));
    }

    // || is the weakest binder
    let mut any = false;
    for clause in condition.split("||") {
        let mut all = true;
        for term in clause.split("&&") {
            if !evaluate_term(term.trim(), context)? {
                all = false;
                break;
            }
        }
        if all {
            any = true;
        }
    }
    Ok(any)
}

fn evaluate_term(term: &str, context: &Value) -> Result<bool, OrdoError> {
    if term.is_empty() {
        return Err(OrdoError::ConditionEval("empty term in condition".into()));
    }

    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some((lhs, rhs)) = term.split_once(op) {
            let left = resolve_operand(lhs.trim(), context)?;
            let right = resolve_operand(rhs.trim(), context)?;
            return compare(op, &left, &right);
        }
    }

    // bare operand: truthiness
    let value = resolve_operand(term, context)?;
    Ok(is_truthy(&value))
}

fn compare(op: &str, left: &Value, right: &Value) -> Result<bool, OrdoError> {
    match op {
        "==" => Ok(loose_eq(left, right)),
        "!=" => Ok(!loose_eq(left, right)),
        _ => {
            let (l, r) = match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => (l, r),
                _ => {
                    return Err(OrdoError::ConditionEval(format!(
                        "ordering comparison needs numbers, got {left} {op} {right}"
                    )))
                }
            };
            Ok(match op {
                ">" => l > r,
                ">=" => l >= r,
                "<" => l < r,
                "<=" => l <= r,
                _ => unreachable!("operator list is closed"),
            })
        }
    }
}

/// Equality with numeric widening (1 == 1.0)
fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l == r;
    }
    left == right
}

fn resolve_operand(raw: &str, context: &Value) -> Result<Value, OrdoError> {
    match raw {
        "" => return Err(OrdoError::ConditionEval("empty operand".into())),
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }

    // quoted string literal
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
    }

    // numeric literal
    if raw
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == '-')
    {
        if let Ok(n) = serde_json::from_str::<Value>(raw) {
            if n.is_number() {
                return Ok(n);
            }
        }
        return Err(OrdoError::ConditionEval(format!("bad numeric literal {raw:?}")));
    }

    // path into the context; missing resolves to null
    match jsonpath::resolve(context, raw) {
        Ok(value) => Ok(value.unwrap_or(Value::Null)),
        Err(e) => Err(OrdoError::ConditionEval(e.to_string())),
    }
}

// ============================================================================
// TESTS
// ============================================================================
