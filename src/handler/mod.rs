//! # Action Dispatcher & Handlers
//!
//! Routes an action to exactly one kind-specific handler and enforces the
//! uniform [`ActionResult`] shape. Handlers never panic outward and never
//! return a bare error: every failure is encoded in the result, split into
//! transient (`retryable: true`) and permanent.
//!
//! | Kind | Handler |
//! |------|---------|
//! | `llm` | [`llm`]: prompt resolution, template render, backend call |
//! | `context` | [`context`]: passthrough or merge |
//! | `mock` | [`mock`]: schema-driven generation, seedable |
//! | `workflow` | [`workflow`]: child run + suspension |
//! | `http` | [`http`]: egress with SSRF validation |
//! | others | contract-conforming `unimplemented_kind` failures |

pub mod context;
pub mod http;
pub mod llm;
pub mod mock;
pub mod workflow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::action::{ActionDefinition, ActionKind};
use crate::backend::LlmBackend;
use crate::resource::{ResourceService, RunLink};

/// The uniform result every handler returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub success: bool,

    #[serde(default)]
    pub output: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ActionMetrics>,

    /// Present when the token must suspend instead of completing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting: Option<Waiting>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    pub retryable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMetrics {
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_tokens: Option<u64>,
}

/// Suspension marker for sub-workflow actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Waiting {
    /// Always `"subworkflow"` today.
    pub kind: String,

    pub child_run_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ActionResult {
    pub fn ok(output: Value) -> Self {
        Self { success: true, output, error: None, metrics: None, waiting: None }
    }

    pub fn fail(message: impl Into<String>, code: &str, retryable: bool) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(ActionError {
                message: message.into(),
                code: Some(code.to_string()),
                retryable,
            }),
            metrics: None,
            waiting: None,
        }
    }

    pub fn permanent(message: impl Into<String>, code: &str) -> Self {
        Self::fail(message, code, false)
    }

    pub fn suspended(child_run_id: impl Into<String>, timeout_ms: Option<u64>) -> Self {
        Self {
            success: true,
            output: Value::Null,
            error: None,
            metrics: None,
            waiting: Some(Waiting {
                kind: "subworkflow".to_string(),
                child_run_id: child_run_id.into(),
                timeout_ms,
            }),
        }
    }

    fn with_duration(mut self, started: Instant, llm_tokens: Option<u64>) -> Self {
        let duration_ms = started.elapsed().as_millis() as u64;
        let mut metrics = self.metrics.take().unwrap_or_default();
        metrics.duration_ms = duration_ms;
        if metrics.llm_tokens.is_none() {
            metrics.llm_tokens = llm_tokens;
        }
        self.metrics = Some(metrics);
        self
    }
}

/// Identity of the invocation, threaded through to handlers that create
/// child runs.
#[derive(Debug, Clone)]
pub struct ActionEnv {
    pub run_id: String,
    pub root_run_id: String,
    pub token_id: String,
}

/// Starts a child run and returns its id. Implemented by the engine; a
/// trait seam so handlers never hold the engine directly.
#[async_trait]
pub trait SubworkflowSpawner: Send + Sync {
    async fn spawn(
        &self,
        workflow_id: &str,
        workflow_version: Option<u32>,
        input: Value,
        link: RunLink,
    ) -> Result<String, String>;
}

/// Routes actions by kind.
pub struct ActionDispatcher {
    resources: Arc<dyn ResourceService>,
    backend: Arc<dyn LlmBackend>,
    spawner: Arc<dyn SubworkflowSpawner>,
}

impl ActionDispatcher {
    pub fn new(
        resources: Arc<dyn ResourceService>,
        backend: Arc<dyn LlmBackend>,
        spawner: Arc<dyn SubworkflowSpawner>,
    ) -> Self {
        Self { resources, backend, spawner }
    }

    /// Execute one action. Always returns a result; metrics carry the wall
    /// time of the handler.
    pub async fn dispatch(
        &self,
        action: &ActionDefinition,
        input: Value,
        env: &ActionEnv,
    ) -> ActionResult {
        let started = Instant::now();
        let result = match action.kind {
            ActionKind::Llm => {
                llm::execute(
                    &action.implementation,
                    &input,
                    self.resources.as_ref(),
                    self.backend.as_ref(),
                )
                .await
            }
            ActionKind::Context => context::execute(&action.implementation, input),
            ActionKind::Mock => mock::execute(&action.implementation).await,
            ActionKind::Workflow => {
                workflow::execute(&action.implementation, input, self.spawner.as_ref(), env).await
            }
            ActionKind::Http => http::execute(&action.implementation, input).await,
            unimplemented => ActionResult::permanent(
                format!("action kind '{}' has no handler", unimplemented),
                "unimplemented_kind",
            ),
        };
        let tokens = result.metrics.as_ref().and_then(|m| m.llm_tokens);
        result.with_duration(started, tokens)
    }
}

/// Parse a kind-specific implementation object, collapsing malformed
/// definitions into a permanent failure.
pub(crate) fn parse_impl<T: serde::de::DeserializeOwned>(
    implementation: &Value,
    kind: &str,
) -> Result<T, Box<ActionResult>> {
    serde_json::from_value(implementation.clone()).map_err(|e| {
        Box::new(ActionResult::permanent(
            format!("invalid {} implementation: {}", kind, e),
            "invalid_implementation",
        ))
    })
}

/// Evaluation record for expressions a handler resolves against its input.
pub(crate) fn input_record(input: &Value) -> Value {
    let mut record = Map::new();
    record.insert("input".to_string(), input.clone());
    Value::Object(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::resource::InMemoryResources;
    use serde_json::json;

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
            Err("no spawner in this test".to_string())
        }
    }

    fn dispatcher() -> ActionDispatcher {
        ActionDispatcher::new(
            Arc::new(InMemoryResources::new()),
            Arc::new(MockBackend::new()),
            Arc::new(NoSpawner),
        )
    }

    fn env() -> ActionEnv {
        ActionEnv {
            run_id: "r1".into(),
            root_run_id: "r1".into(),
            token_id: "t0".into(),
        }
    }

    #[tokio::test]
    async fn unimplemented_kind_is_permanent() {
        let action = ActionDefinition {
            id: "a".into(),
            version: 1,
            kind: ActionKind::Vector,
            implementation: json!({}),
        };
        let result = dispatcher().dispatch(&action, json!({}), &env()).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(!error.retryable);
        assert_eq!(error.code.as_deref(), Some("unimplemented_kind"));
    }

    #[tokio::test]
    async fn dispatch_attaches_metrics() {
        let action = ActionDefinition {
            id: "a".into(),
            version: 1,
            kind: ActionKind::Context,
            implementation: json!({}),
        };
        let result = dispatcher().dispatch(&action, json!({ "x": 1 }), &env()).await;
        assert!(result.success);
        assert!(result.metrics.is_some());
    }
}
