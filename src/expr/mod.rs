//! # Expression Language
//!
//! Evaluates string expressions against a read-only record of named values
//! (typically `{ input, state, output, result }`). Used by the mapping
//! engine and the step condition evaluator; prompt templates use
//! [`crate::template`] instead and the two are never conflated.
//!
//! ## Supported syntax
//!
//! | Category | Examples |
//! |----------|----------|
//! | Paths | `input.user.name`, `items[0]`, `items[-1]`, `items[*].id` |
//! | Literals | `42`, `3.5`, `"text"`, `'text'`, `true`, `false`, `null` |
//! | Unary | `!flag` |
//! | Arithmetic | `a + b`, `a - b`, `a * b`, `a / b` |
//! | Comparison | `==`, `!=`, `===`, `!==`, `<`, `>`, `<=`, `>=` |
//! | Logical | `a && b`, `c \|\| d` (short-circuit) |
//! | Functions | `exists`, `typeof`, `length`, `contains`, `startswith`, `endswith`, `isEmpty`, `isNumber`, `isString`, `isArray`, `isObject` |
//!
//! Precedence, high to low: `!`; `*` `/`; `+` `-`; comparisons; `&&`; `||`.
//!
//! `==`/`!=` coerce number and numeric string; `===`/`!==` are strict.
//! Missing keys and out-of-bounds indices resolve to the absence value
//! (`null`), never an error. The legacy `$.` prefix is accepted and
//! stripped. Prototype-style keys (`__proto__`, `constructor`, `prototype`)
//! never resolve: only own keys count.

mod eval;
mod parser;
mod token;

pub use eval::{evaluate, evaluate_parsed, resolve_path, truthy};
pub use parser::{parse, BinaryOp, Expr, Seg, UnaryOp};

use thiserror::Error;

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("parse error at byte {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("type error: {0}")]
    Type(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> serde_json::Value {
        json!({
            "input": {
                "user": { "name": "ada", "age": 36 },
                "items": [ { "id": 1 }, { "id": 2 }, { "id": 3 } ],
                "auto": false,
                "empty": {},
            },
            "state": { "count": 3 },
        })
    }

    #[test]
    fn path_access() {
        assert_eq!(evaluate("input.user.name", &ctx()).unwrap(), json!("ada"));
        assert_eq!(evaluate("input.items[0].id", &ctx()).unwrap(), json!(1));
        assert_eq!(evaluate("input.items[-1].id", &ctx()).unwrap(), json!(3));
    }

    #[test]
    fn wildcard_projection() {
        assert_eq!(
            evaluate("input.items[*].id", &ctx()).unwrap(),
            json!([1, 2, 3])
        );
    }

    #[test]
    fn missing_keys_are_absent_not_errors() {
        assert_eq!(evaluate("input.nope.deeper", &ctx()).unwrap(), json!(null));
        assert_eq!(evaluate("input.items[99]", &ctx()).unwrap(), json!(null));
    }

    #[test]
    fn legacy_dollar_prefix() {
        assert_eq!(evaluate("$.input.user.age", &ctx()).unwrap(), json!(36));
    }

    #[test]
    fn prototype_keys_never_resolve() {
        let c = json!({ "input": { "__proto__": { "x": 1 }, "constructor": 2, "prototype": 3 } });
        assert_eq!(evaluate("input.__proto__", &c).unwrap(), json!(null));
        assert_eq!(evaluate("input.__proto__.x", &c).unwrap(), json!(null));
        assert_eq!(evaluate("input.constructor", &c).unwrap(), json!(null));
        assert_eq!(evaluate("input.prototype", &c).unwrap(), json!(null));
        assert_eq!(evaluate("input.toString", &c).unwrap(), json!(null));
    }

    #[test]
    fn loose_vs_strict_equality() {
        assert_eq!(evaluate("input.user.age == \"36\"", &ctx()).unwrap(), json!(true));
        assert_eq!(evaluate("input.user.age === \"36\"", &ctx()).unwrap(), json!(false));
        assert_eq!(evaluate("input.user.age !== \"36\"", &ctx()).unwrap(), json!(true));
        assert_eq!(evaluate("input.user.age != 36", &ctx()).unwrap(), json!(false));
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(evaluate("1 + 2 * 3", &ctx()).unwrap(), json!(7));
        assert_eq!(evaluate("(1 + 2) * 3", &ctx()).unwrap(), json!(9));
        assert_eq!(evaluate("state.count * 2 - 1", &ctx()).unwrap(), json!(5));
        assert_eq!(evaluate("7 / 2", &ctx()).unwrap(), json!(3.5));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(evaluate("1 / 0", &ctx()), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn short_circuit_logic() {
        // The right operand would divide by zero; && must not evaluate it.
        assert_eq!(evaluate("false && 1 / 0", &ctx()).unwrap(), json!(false));
        assert_eq!(evaluate("true || 1 / 0", &ctx()).unwrap(), json!(true));
        assert_eq!(evaluate("!input.auto && state.count > 2", &ctx()).unwrap(), json!(true));
    }

    #[test]
    fn builtin_functions() {
        assert_eq!(evaluate("exists(input.user)", &ctx()).unwrap(), json!(true));
        assert_eq!(evaluate("exists(input.ghost)", &ctx()).unwrap(), json!(false));
        assert_eq!(evaluate("typeof(input.user)", &ctx()).unwrap(), json!("object"));
        assert_eq!(evaluate("length(input.items)", &ctx()).unwrap(), json!(3));
        assert_eq!(evaluate("length(input.user.name)", &ctx()).unwrap(), json!(3));
        assert_eq!(
            evaluate("contains(input.user.name, \"da\")", &ctx()).unwrap(),
            json!(true)
        );
        assert_eq!(
            evaluate("startswith(input.user.name, \"ad\")", &ctx()).unwrap(),
            json!(true)
        );
        assert_eq!(
            evaluate("endswith(input.user.name, \"da\")", &ctx()).unwrap(),
            json!(true)
        );
        assert_eq!(evaluate("isEmpty(input.empty)", &ctx()).unwrap(), json!(true));
        assert_eq!(evaluate("isEmpty(input.items)", &ctx()).unwrap(), json!(false));
        assert_eq!(evaluate("isNumber(input.user.age)", &ctx()).unwrap(), json!(true));
        assert_eq!(evaluate("isString(input.user.name)", &ctx()).unwrap(), json!(true));
        assert_eq!(evaluate("isArray(input.items)", &ctx()).unwrap(), json!(true));
        assert_eq!(evaluate("isObject(input.user)", &ctx()).unwrap(), json!(true));
    }

    #[test]
    fn unknown_function_is_an_error() {
        assert!(matches!(
            evaluate("frobnicate(1)", &ctx()),
            Err(ExprError::UnknownFunction(_))
        ));
    }
}
