//! # Executor (Task Runner)
//!
//! Stateless: every invocation loads the task definition, builds a fresh
//! [`TaskContext`], drives the steps in ordinal order, and returns one
//! aggregated result. All per-task state lives in the context; nothing
//! survives between invocations.
//!
//! Step loop, per step:
//! 1. Evaluate the condition, if any (`continue` / `skip` / `succeed` /
//!    `fail`).
//! 2. Apply the input mapping to produce the action input.
//! 3. Dispatch the action. A `waiting` result suspends the whole task.
//! 4. On failure, apply `onFailure`: `abort` ends the task permanently,
//!    `retry` hands the token back to the coordinator's retry policy,
//!    `continue` records the error in `state._errors` and moves on.
//! 5. Apply the output mapping (or park the output at `state._lastOutput`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::condition::{self, ConditionOutcome};
use crate::context::{keys, TaskContext};
use crate::event::{Emitter, EventKind};
use crate::handler::{ActionDispatcher, ActionEnv, ActionError};
use crate::mapping;
use crate::resource::ResourceService;
use crate::schema;
use crate::task::OnFailure;

/// Everything the executor needs for one task invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub token_id: String,
    pub run_id: String,
    pub root_run_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    pub task_id: String,
    pub task_version: u32,

    pub input: Value,

    /// Node resource bindings, surfaced to steps as `input._resources`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub retry_attempt: u32,

    #[serde(default)]
    pub trace_enabled: bool,
}

/// Aggregated task metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_tokens: Option<u64>,
}

/// Successful task outcome.
#[derive(Debug, Clone)]
pub struct TaskSuccess {
    pub output: Value,
    pub metrics: TaskMetrics,
}

/// Failed task outcome, typed for the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskErrorInfo {
    #[serde(rename = "type")]
    pub error_type: TaskErrorType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_ref: Option<String>,

    pub message: String,

    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorType {
    /// Input or output schema mismatch.
    Validation,
    /// A step failed under `onFailure: abort` (or an exit-schema breach).
    StepFailure,
    /// A step failed under `onFailure: retry`; the coordinator requeues.
    Retry,
    /// The invocation exceeded its time budget.
    Timeout,
    /// Unexpected failure inside the executor.
    Internal,
}

impl TaskErrorInfo {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            error_type: TaskErrorType::Validation,
            step_ref: None,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn step_failure(step_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: TaskErrorType::StepFailure,
            step_ref: Some(step_ref.into()),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retry(step_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: TaskErrorType::Retry,
            step_ref: Some(step_ref.into()),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            error_type: TaskErrorType::Timeout,
            step_ref: None,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            error_type: TaskErrorType::Internal,
            step_ref: None,
            message: message.into(),
            retryable: false,
        }
    }
}

/// The stateless task runner.
pub struct Executor {
    resources: Arc<dyn ResourceService>,
    dispatcher: ActionDispatcher,
    emitter: Arc<Emitter>,
}

impl Executor {
    pub fn new(
        resources: Arc<dyn ResourceService>,
        dispatcher: ActionDispatcher,
        emitter: Arc<Emitter>,
    ) -> Self {
        Self { resources, dispatcher, emitter }
    }

    /// Run one task to completion. The caller owns acking, timeouts, and
    /// delivering the outcome back to the coordinator.
    pub async fn execute(&self, payload: &TaskPayload) -> Result<TaskSuccess, TaskErrorInfo> {
        let started = std::time::Instant::now();

        let task = self
            .resources
            .task(&payload.task_id, payload.task_version)
            .await
            .map_err(|e| TaskErrorInfo::internal(e.to_string()))?;

        self.emitter.emit(
            &payload.run_id,
            EventKind::TaskStarted {
                token_id: payload.token_id.clone(),
                task_id: payload.task_id.clone(),
            },
        );

        if let Some(input_schema) = &task.input_schema {
            if let Err(e) = schema::validate(input_schema, &payload.input) {
                let error = TaskErrorInfo::validation(format!("task input: {}", e));
                self.emit_failed(payload, &error);
                return Err(error);
            }
        }

        let mut ctx = TaskContext::new(build_input(payload));
        let mut metrics = TaskMetrics::default();

        let env = ActionEnv {
            run_id: payload.run_id.clone(),
            root_run_id: payload.root_run_id.clone(),
            token_id: payload.token_id.clone(),
        };

        let mut suspended = false;
        for step in task.ordered_steps() {
            if let Some(cond) = &step.condition {
                match condition::evaluate(cond, &ctx.eval_record()) {
                    ConditionOutcome::Continue => {}
                    ConditionOutcome::Skip => {
                        debug!(step = %step.step_ref, "step skipped by condition");
                        self.emitter.emit(
                            &payload.run_id,
                            EventKind::StepSkipped {
                                token_id: payload.token_id.clone(),
                                step_ref: step.step_ref.clone(),
                            },
                        );
                        continue;
                    }
                    ConditionOutcome::Succeed => {
                        debug!(step = %step.step_ref, "step short-circuited to success");
                        continue;
                    }
                    ConditionOutcome::Fail => {
                        let error = ActionError {
                            message: format!("condition directed step '{}' to fail", step.step_ref),
                            code: Some("condition_fail".to_string()),
                            retryable: false,
                        };
                        match self.apply_failure_policy(payload, step.on_failure, &step.step_ref, error, &mut ctx) {
                            Ok(()) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            // Input mapping; absent means the task input flows through.
            let action_input = match &step.input_mapping {
                Some(input_mapping) => match mapping::apply(input_mapping, &ctx.eval_record()) {
                    Ok(mapped) => Value::Object(mapped),
                    Err(e) => {
                        let error = ActionError {
                            message: e.to_string(),
                            code: Some("mapping_error".to_string()),
                            retryable: false,
                        };
                        match self.apply_failure_policy(payload, step.on_failure, &step.step_ref, error, &mut ctx) {
                            Ok(()) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                },
                None => ctx.input().clone(),
            };

            let action = match self
                .resources
                .action(&step.action_id, step.action_version)
                .await
            {
                Ok(action) => action,
                Err(e) => {
                    let error = ActionError {
                        message: e.to_string(),
                        code: Some("missing_action".to_string()),
                        retryable: false,
                    };
                    match self.apply_failure_policy(payload, step.on_failure, &step.step_ref, error, &mut ctx) {
                        Ok(()) => continue,
                        Err(e) => return Err(e),
                    }
                }
            };

            let result = self.dispatcher.dispatch(&action, action_input, &env).await;

            if let Some(action_metrics) = &result.metrics {
                metrics.llm_tokens = match (metrics.llm_tokens, action_metrics.llm_tokens) {
                    (Some(a), Some(b)) => Some(a + b),
                    (a, b) => a.or(b),
                };
            }

            if let Some(waiting) = &result.waiting {
                // Suspension: surface the marker and stop iterating steps.
                mapping::write_path(
                    &mut ctx.output,
                    keys::SUBWORKFLOW,
                    serde_json::to_value(waiting).unwrap_or(Value::Null),
                )
                .expect("well-formed marker path");
                suspended = true;
                break;
            }

            if !result.success {
                let error = result.error.clone().unwrap_or(ActionError {
                    message: "action failed without detail".to_string(),
                    code: None,
                    retryable: false,
                });
                match self.apply_failure_policy(payload, step.on_failure, &step.step_ref, error, &mut ctx) {
                    Ok(()) => continue,
                    Err(e) => return Err(e),
                }
            }

            match &step.output_mapping {
                Some(output_mapping) => {
                    let record = ctx.eval_record_with_result(&result.output);
                    if let Err(e) = apply_step_output(output_mapping, &record, &mut ctx) {
                        let error = ActionError {
                            message: e.to_string(),
                            code: Some("mapping_error".to_string()),
                            retryable: false,
                        };
                        match self.apply_failure_policy(payload, step.on_failure, &step.step_ref, error, &mut ctx) {
                            Ok(()) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                }
                None => ctx.record_last_output(result.output.clone()),
            }
        }

        if !suspended {
            if let Some(output_schema) = &task.output_schema {
                if let Err(e) = schema::validate(output_schema, &ctx.output) {
                    let error = TaskErrorInfo {
                        error_type: TaskErrorType::StepFailure,
                        step_ref: None,
                        message: format!("task output: {}", e),
                        retryable: false,
                    };
                    self.emit_failed(payload, &error);
                    return Err(error);
                }
            }
        }

        metrics.duration_ms = started.elapsed().as_millis() as u64;
        self.emitter.emit(
            &payload.run_id,
            EventKind::TaskCompleted {
                token_id: payload.token_id.clone(),
                task_id: payload.task_id.clone(),
            },
        );

        Ok(TaskSuccess { output: effective_output(ctx), metrics })
    }

    /// Route a failed step through its `onFailure` policy. `Ok(())` means
    /// the task continues.
    fn apply_failure_policy(
        &self,
        payload: &TaskPayload,
        policy: OnFailure,
        step_ref: &str,
        error: ActionError,
        ctx: &mut TaskContext,
    ) -> Result<(), TaskErrorInfo> {
        self.emitter.emit(
            &payload.run_id,
            EventKind::StepFailed {
                token_id: payload.token_id.clone(),
                step_ref: step_ref.to_string(),
                message: error.message.clone(),
            },
        );
        match policy {
            OnFailure::Abort => {
                let info = TaskErrorInfo::step_failure(step_ref, error.message);
                self.emit_failed(payload, &info);
                Err(info)
            }
            OnFailure::Retry => {
                let info = TaskErrorInfo::retry(step_ref, error.message);
                self.emit_failed(payload, &info);
                Err(info)
            }
            OnFailure::Continue => {
                ctx.push_error(step_ref, serde_json::to_value(&error).unwrap_or(Value::Null));
                Ok(())
            }
        }
    }

    fn emit_failed(&self, payload: &TaskPayload, error: &TaskErrorInfo) {
        self.emitter.emit(
            &payload.run_id,
            EventKind::TaskFailed {
                token_id: payload.token_id.clone(),
                task_id: payload.task_id.clone(),
                error: error.message.clone(),
            },
        );
    }
}

/// The value a completed task hands back. Mapped output wins; a task whose
/// steps never mapped anything falls back to `state._lastOutput` with the
/// injected bookkeeping keys stripped, so a bare passthrough task returns
/// what it was given.
fn effective_output(ctx: TaskContext) -> Value {
    let mapped = !matches!(&ctx.output, Value::Object(map) if map.is_empty());
    if mapped {
        return ctx.output;
    }
    match ctx.state.get(keys::LAST_OUTPUT) {
        Some(Value::Object(map)) => {
            let mut clean = map.clone();
            clean.retain(|k, _| !k.starts_with('_') && !k.starts_with('@'));
            Value::Object(clean)
        }
        Some(other) => other.clone(),
        None => ctx.output,
    }
}

/// Payload input enriched with invocation identity.
fn build_input(payload: &TaskPayload) -> Value {
    let mut input = match &payload.input {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    input.insert(keys::RUN_ID.to_string(), json!(payload.run_id));
    input.insert(keys::TOKEN_ID.to_string(), json!(payload.token_id));
    if let Some(resources) = &payload.resources {
        input.insert(keys::RESOURCES.to_string(), resources.clone());
    }
    Value::Object(input)
}

/// Write one step's output mapping into the context regions. Targets are
/// dotted paths whose first segment picks the region (`output.x`,
/// `state.y`); bare paths land in `output`.
fn apply_step_output(
    output_mapping: &Map<String, Value>,
    record: &Value,
    ctx: &mut TaskContext,
) -> Result<(), mapping::MappingError> {
    let resolved = mapping::apply(output_mapping, record)?;
    for (target, value) in resolved {
        if let Some(rest) = target.strip_prefix("output.") {
            mapping::write_path(&mut ctx.output, rest, value)?;
        } else if let Some(rest) = target.strip_prefix("state.") {
            mapping::write_path(&mut ctx.state, rest, value)?;
        } else {
            mapping::write_path(&mut ctx.output, &target, value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionDefinition, ActionKind};
    use crate::backend::MockBackend;
    use crate::handler::SubworkflowSpawner;
    use crate::resource::{InMemoryResources, RunLink};
    use crate::task::TaskDefinition;
    use async_trait::async_trait;

    struct NoSpawner;

    #[async_trait]
    impl SubworkflowSpawner for NoSpawner {
        async fn spawn(
            &self,
            _workflow_id: &str,
            _workflow_version: Option<u32>,
            _input: Value,
            _link: RunLink,
        ) -> Result<String, String> {
            Ok("child-run".to_string())
        }
    }

    fn passthrough_action() -> ActionDefinition {
        ActionDefinition {
            id: "pass".into(),
            version: 1,
            kind: ActionKind::Context,
            implementation: json!({}),
        }
    }

    fn fixture(task_yaml: &str) -> (Executor, Arc<Emitter>, Arc<InMemoryResources>) {
        let resources = Arc::new(InMemoryResources::new());
        resources.register_action(passthrough_action());
        let task: TaskDefinition = serde_yaml::from_str(task_yaml).unwrap();
        resources.register_task(task);

        let emitter = Arc::new(Emitter::new());
        let dispatcher = ActionDispatcher::new(
            resources.clone(),
            Arc::new(MockBackend::new()),
            Arc::new(NoSpawner),
        );
        (
            Executor::new(resources.clone(), dispatcher, emitter.clone()),
            emitter,
            resources,
        )
    }

    fn payload(input: Value) -> TaskPayload {
        TaskPayload {
            token_id: "t0".into(),
            run_id: "r1".into(),
            root_run_id: "r1".into(),
            project_id: None,
            task_id: "greet".into(),
            task_version: 1,
            input,
            resources: None,
            timeout_ms: None,
            retry_attempt: 0,
            trace_enabled: false,
        }
    }

    #[tokio::test]
    async fn unmapped_passthrough_returns_clean_input() {
        let (executor, _, _) = fixture(
            r#"
id: greet
steps:
  - { ref: only, ordinal: 0, actionId: pass }
"#,
        );
        let success = executor.execute(&payload(json!({ "name": "World" }))).await.unwrap();
        // No output mapping: the last action output flows through, minus
        // the injected bookkeeping keys.
        assert_eq!(success.output, json!({ "name": "World" }));
    }

    #[tokio::test]
    async fn output_mapping_writes_into_regions() {
        let (executor, _, _) = fixture(
            r#"
id: greet
steps:
  - ref: only
    ordinal: 0
    actionId: pass
    outputMapping:
      output.name: "result.name"
      state.copy: "result.name"
"#,
        );
        let success = executor.execute(&payload(json!({ "name": "World" }))).await.unwrap();
        assert_eq!(success.output, json!({ "name": "World" }));
    }

    #[tokio::test]
    async fn condition_skip_avoids_dispatch() {
        let (executor, emitter, _) = fixture(
            r#"
id: greet
steps:
  - ref: gated
    ordinal: 0
    actionId: pass
    condition:
      if: "input.auto == false"
      then: skip
      else: continue
"#,
        );
        let success = executor.execute(&payload(json!({ "auto": false }))).await.unwrap();
        assert_eq!(success.output, json!({}));
        assert_eq!(emitter.of_kind("r1", "executor.step.skipped").len(), 1);
        assert_eq!(emitter.of_kind("r1", "executor.task.completed").len(), 1);
    }

    #[tokio::test]
    async fn missing_action_aborts_by_default() {
        let (executor, _, _) = fixture(
            r#"
id: greet
steps:
  - { ref: broken, ordinal: 0, actionId: ghost }
"#,
        );
        let error = executor.execute(&payload(json!({}))).await.unwrap_err();
        assert_eq!(error.error_type, TaskErrorType::StepFailure);
        assert_eq!(error.step_ref.as_deref(), Some("broken"));
        assert!(!error.retryable);
    }

    #[tokio::test]
    async fn on_failure_continue_records_and_proceeds() {
        let (executor, _, _) = fixture(
            r#"
id: greet
steps:
  - { ref: broken, ordinal: 0, actionId: ghost, onFailure: continue }
  - ref: after
    ordinal: 1
    actionId: pass
    outputMapping:
      output.errors: "state._errors"
"#,
        );
        let success = executor.execute(&payload(json!({}))).await.unwrap();
        let errors = success.output["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["step"], json!("broken"));
    }

    #[tokio::test]
    async fn on_failure_retry_is_retryable() {
        let (executor, _, _) = fixture(
            r#"
id: greet
steps:
  - { ref: flaky, ordinal: 0, actionId: ghost, onFailure: retry }
"#,
        );
        let error = executor.execute(&payload(json!({}))).await.unwrap_err();
        assert_eq!(error.error_type, TaskErrorType::Retry);
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn input_schema_mismatch_is_validation_error() {
        let (executor, _, _) = fixture(
            r#"
id: greet
inputSchema:
  type: object
  required: [name]
steps:
  - { ref: only, ordinal: 0, actionId: pass }
"#,
        );
        let error = executor.execute(&payload(json!({}))).await.unwrap_err();
        assert_eq!(error.error_type, TaskErrorType::Validation);
        assert!(!error.retryable);
    }

    #[tokio::test]
    async fn subworkflow_marker_suspends_remaining_steps() {
        let (executor, _, resources) = fixture(
            r#"
id: greet
steps:
  - { ref: spawn, ordinal: 0, actionId: child }
  - { ref: never, ordinal: 1, actionId: ghost }
"#,
        );
        resources.register_action(ActionDefinition {
            id: "child".into(),
            version: 1,
            kind: ActionKind::Workflow,
            implementation: json!({ "workflowId": "sub" }),
        });

        let success = executor.execute(&payload(json!({ "x": 5 }))).await.unwrap();
        let marker = &success.output["_subworkflow"];
        assert_eq!(marker["childRunId"], json!("child-run"));
        // The second (failing) step never ran.
    }

    #[tokio::test]
    async fn identity_keys_are_injected() {
        let (executor, _, _) = fixture(
            r#"
id: greet
steps:
  - ref: only
    ordinal: 0
    actionId: pass
    outputMapping:
      output.run: "input._runId"
      output.token: "input._tokenId"
"#,
        );
        let success = executor.execute(&payload(json!({}))).await.unwrap();
        assert_eq!(success.output["run"], json!("r1"));
        assert_eq!(success.output["token"], json!("t0"));
    }
}
