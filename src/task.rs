//! # Task Definitions
//!
//! A task is an ordered list of steps; each step invokes one action,
//! optionally guarded by a condition and governed by a per-step failure
//! policy. Retry and timeout settings live at the task level.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::condition::StepCondition;

fn default_version() -> u32 {
    1
}

/// Immutable task, identified by `(id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub id: String,

    #[serde(default = "default_version")]
    pub version: u32,

    /// Ordered by `ordinal`, contiguous from 0. Validation enforces this.
    pub steps: Vec<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TaskDefinition {
    /// Steps in execution order.
    pub fn ordered_steps(&self) -> Vec<&Step> {
        let mut steps: Vec<&Step> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.ordinal);
        steps
    }
}

/// One execution of one action within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(rename = "ref")]
    pub step_ref: String,

    pub ordinal: u32,

    pub action_id: String,

    #[serde(default = "default_version")]
    pub action_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mapping: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mapping: Option<Map<String, Value>>,

    #[serde(default)]
    pub on_failure: OnFailure,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
}

/// Per-step failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Terminate the task with a permanent step failure.
    #[default]
    Abort,
    /// Terminate the task and let the coordinator requeue it.
    Retry,
    /// Record the error in `state._errors` and move on.
    Continue,
}

/// Task-level retry policy, applied by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_initial_delay() -> u64 {
    1_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Constant delay between attempts.
    #[default]
    None,
    Linear,
    Exponential,
}

impl RetryPolicy {
    /// Delay before retry attempt `n` (1-based), capped at `maxDelayMs`.
    ///
    /// Exponential: `min(initialDelayMs * 2^(n-1), maxDelayMs)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let base = match self.backoff {
            Backoff::None => self.initial_delay_ms,
            Backoff::Linear => self.initial_delay_ms.saturating_mul(n as u64),
            Backoff::Exponential => self
                .initial_delay_ms
                .saturating_mul(1u64.checked_shl(n - 1).unwrap_or(u64::MAX)),
        };
        let capped = match self.max_delay_ms {
            Some(max) => base.min(max),
            None => base,
        };
        Duration::from_millis(capped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_step_defaults() {
        let yaml = r#"
id: greet
steps:
  - ref: hello
    ordinal: 0
    actionId: say-hello
"#;
        let task: TaskDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.version, 1);
        let step = &task.steps[0];
        assert_eq!(step.action_version, 1);
        assert_eq!(step.on_failure, OnFailure::Abort);
        assert!(step.condition.is_none());
    }

    #[test]
    fn steps_sort_by_ordinal() {
        let yaml = r#"
id: t
steps:
  - { ref: b, ordinal: 1, actionId: x }
  - { ref: a, ordinal: 0, actionId: x }
"#;
        let task: TaskDefinition = serde_yaml::from_str(yaml).unwrap();
        let order: Vec<&str> = task.ordered_steps().iter().map(|s| s.step_ref.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::Exponential,
            initial_delay_ms: 10,
            max_delay_ms: Some(35),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(35));
        assert_eq!(policy.delay_for(4), Duration::from_millis(35));
    }

    #[test]
    fn linear_and_constant_backoff() {
        let linear = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Linear,
            initial_delay_ms: 10,
            max_delay_ms: None,
        };
        assert_eq!(linear.delay_for(3), Duration::from_millis(30));

        let constant = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::None,
            initial_delay_ms: 10,
            max_delay_ms: None,
        };
        assert_eq!(constant.delay_for(3), Duration::from_millis(10));
    }
}
