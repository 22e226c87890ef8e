//! Evaluation of parsed expressions against [`Bindings`].

use serde_json::Value;

use super::parser::{BinaryOp, Expr};
use super::Bindings;
use crate::error::{EngineError, EngineResult};

/// Evaluate `expr` to a JSON value.
pub fn eval(expr: &Expr, bindings: &Bindings) -> EngineResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Context(name) => bindings.context(name).cloned().ok_or_else(|| {
            EngineError::Expression(format!("Unrecognized named-value: '{}'", name))
        }),
        Expr::Member(base, name) => Ok(property(&eval(base, bindings)?, name)),
        Expr::Index(base, index) => {
            let base = eval(base, bindings)?;
            let index = eval(index, bindings)?;
            Ok(match (&base, &index) {
                (Value::Array(items), Value::Number(n)) => n
                    .as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                    .and_then(|f| items.get(f as usize))
                    .cloned()
                    .unwrap_or(Value::Null),
                (Value::Object(_), _) => property(&base, &to_display_string(&index)),
                _ => Value::Null,
            })
        }
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&eval(inner, bindings)?))),
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, bindings),
        Expr::Call(name, args) => call(name, args, bindings),
    }
}

fn eval_binary(op: BinaryOp, left: &Expr, right: &Expr, bindings: &Bindings) -> EngineResult<Value> {
    // Logical operators short-circuit and yield an operand, not a bool.
    match op {
        BinaryOp::Or => {
            let l = eval(left, bindings)?;
            return if is_truthy(&l) { Ok(l) } else { eval(right, bindings) };
        }
        BinaryOp::And => {
            let l = eval(left, bindings)?;
            return if is_truthy(&l) { eval(right, bindings) } else { Ok(l) };
        }
        _ => {}
    }

    let l = eval(left, bindings)?;
    let r = eval(right, bindings)?;
    Ok(match op {
        BinaryOp::Add => {
            if l.is_string() || r.is_string() {
                Value::String(format!("{}{}", to_display_string(&l), to_display_string(&r)))
            } else {
                number_value(to_number(&l) + to_number(&r))
            }
        }
        BinaryOp::Eq => Value::Bool(loose_equals(&l, &r)),
        BinaryOp::Ne => Value::Bool(!loose_equals(&l, &r)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&l, &r) {
                (Value::String(a), Value::String(b)) => {
                    Some(a.to_lowercase().cmp(&b.to_lowercase()))
                }
                _ => to_number(&l).partial_cmp(&to_number(&r)),
            };
            Value::Bool(match ordering {
                None => false,
                Some(ordering) => match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                },
            })
        }
        BinaryOp::Or | BinaryOp::And => unreachable!("handled above"),
    })
}

fn call(name: &str, args: &[Expr], bindings: &Bindings) -> EngineResult<Value> {
    let lowered = name.to_ascii_lowercase();
    let arity = |min: usize, max: usize| -> EngineResult<()> {
        if args.len() < min || args.len() > max {
            return Err(EngineError::Expression(format!(
                "{}() takes {} to {} arguments, got {}",
                name,
                min,
                max,
                args.len()
            )));
        }
        Ok(())
    };

    match lowered.as_str() {
        "success" => {
            arity(0, 0)?;
            Ok(Value::Bool(bindings.status.success()))
        }
        "failure" => {
            arity(0, 0)?;
            Ok(Value::Bool(bindings.status.failed))
        }
        "always" => {
            arity(0, 0)?;
            Ok(Value::Bool(true))
        }
        "cancelled" => {
            arity(0, 0)?;
            Ok(Value::Bool(bindings.status.cancelled))
        }
        "contains" => {
            arity(2, 2)?;
            let haystack = eval(&args[0], bindings)?;
            let needle = eval(&args[1], bindings)?;
            Ok(Value::Bool(match &haystack {
                Value::Array(items) => items.iter().any(|item| loose_equals(item, &needle)),
                other => to_display_string(other)
                    .to_lowercase()
                    .contains(&to_display_string(&needle).to_lowercase()),
            }))
        }
        "startswith" | "endswith" => {
            arity(2, 2)?;
            let subject = to_display_string(&eval(&args[0], bindings)?).to_lowercase();
            let affix = to_display_string(&eval(&args[1], bindings)?).to_lowercase();
            Ok(Value::Bool(if lowered == "startswith" {
                subject.starts_with(&affix)
            } else {
                subject.ends_with(&affix)
            }))
        }
        "format" => {
            if args.is_empty() {
                return Err(EngineError::Expression(
                    "format() requires a format string".to_string(),
                ));
            }
            let template = to_display_string(&eval(&args[0], bindings)?);
            let values = args[1..]
                .iter()
                .map(|arg| eval(arg, bindings).map(|v| to_display_string(&v)))
                .collect::<EngineResult<Vec<_>>>()?;
            format_string(&template, &values).map(Value::String)
        }
        "join" => {
            arity(1, 2)?;
            let items = eval(&args[0], bindings)?;
            let separator = match args.get(1) {
                Some(arg) => to_display_string(&eval(arg, bindings)?),
                None => ",".to_string(),
            };
            Ok(Value::String(match items {
                Value::Array(items) => items
                    .iter()
                    .map(to_display_string)
                    .collect::<Vec<_>>()
                    .join(&separator),
                other => to_display_string(&other),
            }))
        }
        "tojson" => {
            arity(1, 1)?;
            let value = eval(&args[0], bindings)?;
            Ok(Value::String(serde_json::to_string_pretty(&value)?))
        }
        "fromjson" => {
            arity(1, 1)?;
            let text = to_display_string(&eval(&args[0], bindings)?);
            Ok(serde_json::from_str(&text)?)
        }
        _ => Err(EngineError::Expression(format!(
            "Unrecognized function: '{}'",
            name
        ))),
    }
}

/// `format('{0} and {1}', a, b)` with `{{` and `}}` as literal braces.
fn format_string(template: &str, values: &[String]) -> EngineResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(d) if d.is_ascii_digit() => digits.push(d),
                        _ => {
                            return Err(EngineError::Expression(format!(
                                "invalid format string '{}'",
                                template
                            )))
                        }
                    }
                }
                let value = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| values.get(index))
                    .ok_or_else(|| {
                        EngineError::Expression(format!(
                            "format argument {{{}}} out of range in '{}'",
                            digits, template
                        ))
                    })?;
                out.push_str(value);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Object member lookup; exact key first, then case-insensitive.
fn property(base: &Value, name: &str) -> Value {
    let Value::Object(map) = base else {
        return Value::Null;
    };
    map.get(name)
        .or_else(|| {
            map.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
        .cloned()
        .unwrap_or(Value::Null)
}

/// Truthiness: `null`, `false`, `0`, `NaN` and `''` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

fn number_value(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Equality with string case folding and numeric coercion across types.
fn loose_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            left == right
        }
        _ => {
            let (a, b) = (to_number(left), to_number(right));
            !a.is_nan() && !b.is_nan() && a == b
        }
    }
}

/// String form of an evaluated value as it appears in rendered templates.
///
/// `null` renders as the empty string and integral floats drop the
/// fractional part.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (_, Some(u), _) => u.to_string(),
            (_, _, Some(f)) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
