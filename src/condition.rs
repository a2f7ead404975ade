//! # Step Condition Evaluator
//!
//! A step may carry `condition: { if, then, else }`. The `if` expression is
//! evaluated against the step's view of the task context and coerced with
//! the truthiness rules of [`crate::expr::truthy`] (empty object truthy,
//! zero falsy). Evaluation errors collapse to [`ConditionOutcome::Skip`] and
//! never propagate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::expr;

/// What to do with a guarded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOutcome {
    /// Execute the step.
    #[default]
    Continue,
    /// Do not execute; do not fail.
    Skip,
    /// Do not execute; mark the step successful.
    Succeed,
    /// Raise a step failure that enters the task's failure policy.
    Fail,
}

/// Declarative step guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    #[serde(rename = "if")]
    pub if_expr: String,

    #[serde(default)]
    pub then: ConditionOutcome,

    /// A guard that fails should gate the step, not fail the task.
    #[serde(rename = "else", default = "default_else")]
    pub else_: ConditionOutcome,
}

fn default_else() -> ConditionOutcome {
    ConditionOutcome::Skip
}

/// Evaluate a step condition against a context record.
pub fn evaluate(condition: &StepCondition, ctx: &Value) -> ConditionOutcome {
    match expr::evaluate(&condition.if_expr, ctx) {
        Ok(value) => {
            if expr::truthy(&value) {
                condition.then
            } else {
                condition.else_
            }
        }
        Err(err) => {
            warn!(expr = %condition.if_expr, error = %err, "condition evaluation failed, skipping step");
            ConditionOutcome::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(if_expr: &str, then: ConditionOutcome, else_: ConditionOutcome) -> StepCondition {
        StepCondition {
            if_expr: if_expr.to_string(),
            then,
            else_,
        }
    }

    #[test]
    fn true_selects_then() {
        let c = cond("input.auto == false", ConditionOutcome::Skip, ConditionOutcome::Continue);
        assert_eq!(evaluate(&c, &json!({ "input": { "auto": false } })), ConditionOutcome::Skip);
    }

    #[test]
    fn false_selects_else() {
        let c = cond("input.auto == false", ConditionOutcome::Skip, ConditionOutcome::Continue);
        assert_eq!(
            evaluate(&c, &json!({ "input": { "auto": true } })),
            ConditionOutcome::Continue
        );
    }

    #[test]
    fn errors_collapse_to_skip() {
        let c = cond("1 / 0", ConditionOutcome::Fail, ConditionOutcome::Fail);
        assert_eq!(evaluate(&c, &json!({})), ConditionOutcome::Skip);
        let c = cond("not ( valid", ConditionOutcome::Continue, ConditionOutcome::Continue);
        assert_eq!(evaluate(&c, &json!({})), ConditionOutcome::Skip);
    }

    #[test]
    fn empty_object_is_truthy_zero_is_falsy() {
        let c = cond("input.x", ConditionOutcome::Continue, ConditionOutcome::Skip);
        assert_eq!(evaluate(&c, &json!({ "input": { "x": {} } })), ConditionOutcome::Continue);
        assert_eq!(evaluate(&c, &json!({ "input": { "x": 0 } })), ConditionOutcome::Skip);
    }

    #[test]
    fn yaml_defaults() {
        let c: StepCondition = serde_yaml::from_str("if: \"input.ok\"").unwrap();
        assert_eq!(c.then, ConditionOutcome::Continue);
        assert_eq!(c.else_, ConditionOutcome::Skip);
    }
}
