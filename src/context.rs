//! # Task and Run Contexts
//!
//! A task executes against a three-region context:
//!
//! | Region | Mutability | Purpose |
//! |--------|------------|---------|
//! | `input` | frozen | produced by the node's input mapping |
//! | `state` | mutable | scratchpad: step outputs, `_errors`, `_lastOutput` |
//! | `output` | mutable | written via output mappings; returned on success |
//!
//! Run-level context travels on tokens: the parent token's output becomes
//! the child's `input`, enriched with fan-out metadata (`@index`, `@first`,
//! `@last`, `@key`, `@root`) when the child came from `spawnCount` or
//! `foreach`.

use serde_json::{json, Map, Value};

/// Well-known keys injected into contexts.
pub mod keys {
    /// Fan-out position of this token.
    pub const INDEX: &str = "@index";
    pub const FIRST: &str = "@first";
    pub const LAST: &str = "@last";
    /// Property name when iterating an object with `foreach`.
    pub const KEY: &str = "@key";
    /// The run's frozen input.
    pub const ROOT: &str = "@root";
    /// The element assigned to this token by `foreach`.
    pub const FOREACH_ITEM: &str = "_foreachItem";
    /// Marker a `workflow` action leaves for the coordinator.
    pub const SUBWORKFLOW: &str = "_subworkflow";
    /// Where unmapped action output accumulates.
    pub const LAST_OUTPUT: &str = "_lastOutput";
    /// Non-fatal step errors under `onFailure: continue`.
    pub const ERRORS: &str = "_errors";
    pub const RUN_ID: &str = "_runId";
    pub const TOKEN_ID: &str = "_tokenId";
    pub const RESOURCES: &str = "_resources";
}

/// Context for a single task invocation. Owned by the executor; dropped
/// when the task returns.
#[derive(Debug, Clone)]
pub struct TaskContext {
    input: Value,
    pub state: Value,
    pub output: Value,
}

impl TaskContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            state: Value::Object(Map::new()),
            output: Value::Object(Map::new()),
        }
    }

    /// The frozen input region.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// The record expressions evaluate against: `{ input, state, output }`.
    pub fn eval_record(&self) -> Value {
        json!({
            "input": self.input,
            "state": self.state,
            "output": self.output,
        })
    }

    /// Like [`Self::eval_record`] with the current action output bound to
    /// `result` for output mappings.
    pub fn eval_record_with_result(&self, result: &Value) -> Value {
        json!({
            "input": self.input,
            "state": self.state,
            "output": self.output,
            "result": result,
        })
    }

    /// Store an unmapped action output at `state._lastOutput`.
    pub fn record_last_output(&mut self, output: Value) {
        self.state_object().insert(keys::LAST_OUTPUT.to_string(), output);
    }

    /// Append a non-fatal step error to `state._errors`.
    pub fn push_error(&mut self, step_ref: &str, error: Value) {
        let entry = json!({ "step": step_ref, "error": error });
        match self.state_object().get_mut(keys::ERRORS) {
            Some(Value::Array(errors)) => errors.push(entry),
            _ => {
                self.state_object()
                    .insert(keys::ERRORS.to_string(), Value::Array(vec![entry]));
            }
        }
    }

    fn state_object(&mut self) -> &mut Map<String, Value> {
        if !self.state.is_object() {
            self.state = Value::Object(Map::new());
        }
        self.state.as_object_mut().expect("state coerced to object")
    }
}

/// Metadata attached to one fan-out child.
#[derive(Debug, Clone)]
pub struct FanoutMeta {
    pub index: usize,
    pub total: usize,
    /// Property name for object `foreach`; `None` for arrays and spawnCount.
    pub key: Option<String>,
    /// Element for `foreach`; `None` for bare spawnCount fan-out.
    pub item: Option<Value>,
}

impl FanoutMeta {
    /// Merge this metadata into a child token's input object.
    pub fn apply(&self, input: &mut Map<String, Value>) {
        input.insert(keys::INDEX.to_string(), json!(self.index));
        input.insert(keys::FIRST.to_string(), json!(self.index == 0));
        input.insert(keys::LAST.to_string(), json!(self.index + 1 == self.total));
        if let Some(key) = &self.key {
            input.insert(keys::KEY.to_string(), json!(key));
        }
        if let Some(item) = &self.item {
            input.insert(keys::FOREACH_ITEM.to_string(), item.clone());
        }
    }
}
