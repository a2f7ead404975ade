//! Expression evaluation over `serde_json` values.
//!
//! The evaluator is pure: same `(expression, context)` in, same value out.
//! Absence (missing key, out-of-bounds index) resolves to `Value::Null` in
//! value position; `exists()` distinguishes absent from explicit null by
//! resolving the path itself.

use serde_json::Value;

use super::parser::{number_value, parse, BinaryOp, Expr, Seg, UnaryOp};
use super::ExprError;

/// Keys that never resolve, mirroring a prototype-chain walk.
const DENIED_KEYS: &[&str] = &["__proto__", "constructor", "prototype", "toString"];

/// Parse and evaluate an expression against a context record.
pub fn evaluate(src: &str, ctx: &Value) -> Result<Value, ExprError> {
    let expr = parse(src)?;
    evaluate_parsed(&expr, ctx)
}

/// Evaluate an already-parsed expression.
pub fn evaluate_parsed(expr: &Expr, ctx: &Value) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segs) => Ok(resolve_path(ctx, segs).unwrap_or(Value::Null)),
        Expr::Unary(op, inner) => {
            let v = evaluate_parsed(inner, ctx)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                UnaryOp::Neg => match as_number(&v) {
                    Some(n) => Ok(number_value(-n)),
                    None => Err(ExprError::Type("cannot negate a non-number".into())),
                },
            }
        }
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, ctx),
        Expr::Call(name, args) => eval_call(name, args, ctx),
    }
}

/// Resolve a path against a value. `None` means absent.
pub fn resolve_path(root: &Value, segs: &[Seg]) -> Option<Value> {
    let mut current = root.clone();
    for (i, seg) in segs.iter().enumerate() {
        match seg {
            Seg::Key(k) => {
                if DENIED_KEYS.contains(&k.as_str()) {
                    return None;
                }
                current = current.as_object()?.get(k)?.clone();
            }
            Seg::Index(idx) => {
                let arr = current.as_array()?;
                let n = arr.len() as i64;
                let eff = if *idx < 0 { n + idx } else { *idx };
                if eff < 0 || eff >= n {
                    return None;
                }
                current = arr[eff as usize].clone();
            }
            Seg::Wildcard => {
                let arr = current.as_array()?;
                let rest = &segs[i + 1..];
                let projected: Vec<Value> = arr
                    .iter()
                    .filter_map(|el| {
                        if rest.is_empty() {
                            Some(el.clone())
                        } else {
                            resolve_path(el, rest)
                        }
                    })
                    .collect();
                return Some(Value::Array(projected));
            }
        }
    }
    Some(current)
}

/// Truthiness for conditions: JavaScript-like, except an empty object is
/// truthy and `0` is falsy.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn eval_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, ctx: &Value) -> Result<Value, ExprError> {
    // Logical operators short-circuit; everything else evaluates both sides.
    match op {
        BinaryOp::And => {
            let l = evaluate_parsed(lhs, ctx)?;
            if !truthy(&l) {
                return Ok(Value::Bool(false));
            }
            let r = evaluate_parsed(rhs, ctx)?;
            return Ok(Value::Bool(truthy(&r)));
        }
        BinaryOp::Or => {
            let l = evaluate_parsed(lhs, ctx)?;
            if truthy(&l) {
                return Ok(Value::Bool(true));
            }
            let r = evaluate_parsed(rhs, ctx)?;
            return Ok(Value::Bool(truthy(&r)));
        }
        _ => {}
    }

    let l = evaluate_parsed(lhs, ctx)?;
    let r = evaluate_parsed(rhs, ctx)?;

    match op {
        BinaryOp::Add => match (&l, &r) {
            (Value::String(a), _) => Ok(Value::String(format!("{}{}", a, stringify(&r)))),
            (_, Value::String(b)) => Ok(Value::String(format!("{}{}", stringify(&l), b))),
            _ => numeric_op(&l, &r, |a, b| Ok(a + b)),
        },
        BinaryOp::Sub => numeric_op(&l, &r, |a, b| Ok(a - b)),
        BinaryOp::Mul => numeric_op(&l, &r, |a, b| Ok(a * b)),
        BinaryOp::Div => numeric_op(&l, &r, |a, b| {
            if b == 0.0 {
                Err(ExprError::DivisionByZero)
            } else {
                Ok(a / b)
            }
        }),
        BinaryOp::LooseEq => Ok(Value::Bool(loose_eq(&l, &r))),
        BinaryOp::LooseNe => Ok(Value::Bool(!loose_eq(&l, &r))),
        BinaryOp::StrictEq => Ok(Value::Bool(l == r)),
        BinaryOp::StrictNe => Ok(Value::Bool(l != r)),
        BinaryOp::Lt => compare(&l, &r).map(|o| Value::Bool(o == std::cmp::Ordering::Less)),
        BinaryOp::Gt => compare(&l, &r).map(|o| Value::Bool(o == std::cmp::Ordering::Greater)),
        BinaryOp::Le => compare(&l, &r).map(|o| Value::Bool(o != std::cmp::Ordering::Greater)),
        BinaryOp::Ge => compare(&l, &r).map(|o| Value::Bool(o != std::cmp::Ordering::Less)),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn numeric_op(
    l: &Value,
    r: &Value,
    f: impl Fn(f64, f64) -> Result<f64, ExprError>,
) -> Result<Value, ExprError> {
    match (as_number(l), as_number(r)) {
        (Some(a), Some(b)) => f(a, b).map(number_value),
        _ => Err(ExprError::Type(format!(
            "arithmetic on non-numbers: {} and {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

/// Loose equality: strict equality plus number <-> numeric-string coercion.
fn loose_eq(l: &Value, r: &Value) -> bool {
    if l == r {
        return true;
    }
    match (l, r) {
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        _ => false,
    }
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, ExprError> {
    if let (Some(a), Some(b)) = (as_number(l), as_number(r)) {
        return a.partial_cmp(&b).ok_or_else(|| {
            ExprError::Type("incomparable numbers".into())
        });
    }
    if let (Value::String(a), Value::String(b)) = (l, r) {
        return Ok(a.cmp(b));
    }
    Err(ExprError::Type(format!(
        "cannot order {} and {}",
        type_name(l),
        type_name(r)
    )))
}

/// Numeric view of a value: numbers directly, numeric strings coerced.
fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn eval_call(name: &str, args: &[Expr], ctx: &Value) -> Result<Value, ExprError> {
    let arity = |expected: usize| -> Result<(), ExprError> {
        if args.len() != expected {
            Err(ExprError::Arity {
                name: name.to_string(),
                expected,
                got: args.len(),
            })
        } else {
            Ok(())
        }
    };

    match name {
        "exists" => {
            arity(1)?;
            // Presence check: an explicit null still exists.
            match &args[0] {
                Expr::Path(segs) => Ok(Value::Bool(resolve_path(ctx, segs).is_some())),
                other => {
                    let v = evaluate_parsed(other, ctx)?;
                    Ok(Value::Bool(!v.is_null()))
                }
            }
        }
        "typeof" => {
            arity(1)?;
            if let Expr::Path(segs) = &args[0] {
                return Ok(Value::String(
                    resolve_path(ctx, segs)
                        .map(|v| type_name(&v))
                        .unwrap_or("undefined")
                        .to_string(),
                ));
            }
            let v = evaluate_parsed(&args[0], ctx)?;
            Ok(Value::String(type_name(&v).to_string()))
        }
        "length" => {
            arity(1)?;
            let v = evaluate_parsed(&args[0], ctx)?;
            let len = match &v {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(ExprError::Type(format!(
                        "length() expects string, array, or object, got {}",
                        type_name(other)
                    )))
                }
            };
            Ok(Value::Number(len.into()))
        }
        "contains" => {
            arity(2)?;
            let hay = evaluate_parsed(&args[0], ctx)?;
            let needle = evaluate_parsed(&args[1], ctx)?;
            let found = match (&hay, &needle) {
                (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
                (Value::Array(a), n) => a.iter().any(|el| loose_eq(el, n)),
                (Value::Object(o), Value::String(k)) => o.contains_key(k),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        "startswith" => {
            arity(2)?;
            let (s, p) = two_strings(name, args, ctx)?;
            Ok(Value::Bool(s.starts_with(&p)))
        }
        "endswith" => {
            arity(2)?;
            let (s, p) = two_strings(name, args, ctx)?;
            Ok(Value::Bool(s.ends_with(&p)))
        }
        "isEmpty" => {
            arity(1)?;
            let v = evaluate_parsed(&args[0], ctx)?;
            let empty = match &v {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                _ => false,
            };
            Ok(Value::Bool(empty))
        }
        "isNumber" => {
            arity(1)?;
            let v = evaluate_parsed(&args[0], ctx)?;
            Ok(Value::Bool(v.is_number()))
        }
        "isString" => {
            arity(1)?;
            let v = evaluate_parsed(&args[0], ctx)?;
            Ok(Value::Bool(v.is_string()))
        }
        "isArray" => {
            arity(1)?;
            let v = evaluate_parsed(&args[0], ctx)?;
            Ok(Value::Bool(v.is_array()))
        }
        "isObject" => {
            arity(1)?;
            let v = evaluate_parsed(&args[0], ctx)?;
            Ok(Value::Bool(v.is_object()))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

fn two_strings(name: &str, args: &[Expr], ctx: &Value) -> Result<(String, String), ExprError> {
    let a = evaluate_parsed(&args[0], ctx)?;
    let b = evaluate_parsed(&args[1], ctx)?;
    match (a, b) {
        (Value::String(a), Value::String(b)) => Ok((a, b)),
        _ => Err(ExprError::Type(format!("{}() expects two strings", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn purity_same_input_same_output() {
        let ctx = json!({ "input": { "a": [1, 2, 3] } });
        let first = evaluate("input.a[*] ", &ctx).unwrap();
        let second = evaluate("input.a[*] ", &ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn truthiness_table() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!({})));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!(1)));
    }

    #[test]
    fn exists_distinguishes_null_from_absent() {
        let ctx = json!({ "input": { "present": null } });
        assert_eq!(evaluate("exists(input.present)", &ctx).unwrap(), json!(true));
        assert_eq!(evaluate("exists(input.absent)", &ctx).unwrap(), json!(false));
    }

    #[test]
    fn typeof_absent_is_undefined() {
        let ctx = json!({ "input": {} });
        assert_eq!(evaluate("typeof(input.nope)", &ctx).unwrap(), json!("undefined"));
    }

    #[test]
    fn string_concat_with_plus() {
        let ctx = json!({ "input": { "name": "ada" } });
        assert_eq!(
            evaluate("\"hi \" + input.name", &ctx).unwrap(),
            json!("hi ada")
        );
    }

    #[test]
    fn negative_unary() {
        let ctx = json!({});
        assert_eq!(evaluate("-3 + 5", &ctx).unwrap(), json!(2));
    }

    #[test]
    fn comparison_coerces_numeric_strings() {
        let ctx = json!({ "input": { "n": "10" } });
        assert_eq!(evaluate("input.n > 9", &ctx).unwrap(), json!(true));
    }
}
