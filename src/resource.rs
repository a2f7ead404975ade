//! # Resource Service
//!
//! The single source of truth for definitions and run records. Definitions
//! are immutable once versioned; the coordinator caches a snapshot per run.
//! All writes (for example creating a child run record) go through this
//! interface.
//!
//! The engine ships with [`InMemoryResources`], a registry populated by the
//! workspace loader; production deployments substitute their own
//! implementation of [`ResourceService`].

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::action::ActionDefinition;
use crate::definition::WorkflowDefinition;
use crate::run::{Run, RunStatus};
use crate::task::TaskDefinition;

/// Model configuration an `llm` action resolves by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelProfile {
    pub id: String,

    /// Backend model identifier.
    pub model_id: String,

    /// Passed through to the backend verbatim (temperature, maxTokens, ...).
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Reusable prompt an `llm` action may inherit from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSpec {
    pub id: String,

    pub template: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Output schema, inherited as `jsonSchema` unless overridden.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<Value>,
}

/// Parent linkage for a new run record.
#[derive(Debug, Clone, Default)]
pub struct RunLink {
    pub root_run_id: Option<String>,
    pub parent_run_id: Option<String>,
    pub parent_token_id: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResourceError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
}

impl ResourceError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ResourceError::NotFound { kind, id: id.into() }
    }
}

/// Typed lookups the core consumes.
#[async_trait]
pub trait ResourceService: Send + Sync {
    async fn workflow(&self, id: &str, version: u32) -> Result<Arc<WorkflowDefinition>, ResourceError>;

    async fn task(&self, id: &str, version: u32) -> Result<Arc<TaskDefinition>, ResourceError>;

    async fn action(&self, id: &str, version: u32) -> Result<Arc<ActionDefinition>, ResourceError>;

    async fn model_profile(&self, id: &str) -> Result<Arc<ModelProfile>, ResourceError>;

    async fn prompt_spec(&self, id: &str) -> Result<Arc<PromptSpec>, ResourceError>;

    /// Create a run record; the returned run carries a fresh globally
    /// unique id and status `running`.
    async fn create_run(
        &self,
        workflow_id: &str,
        workflow_version: u32,
        input: Value,
        link: RunLink,
    ) -> Result<Run, ResourceError>;

    /// Persist the current state of a run record.
    async fn update_run(&self, run: &Run) -> Result<(), ResourceError>;

    async fn run(&self, run_id: &str) -> Result<Run, ResourceError>;
}

// ============================================================================
// IN-MEMORY REGISTRY
// ============================================================================

/// Registry keyed by `(id, version)`, suitable for tests and the CLI.
#[derive(Default)]
pub struct InMemoryResources {
    workflows: DashMap<(String, u32), Arc<WorkflowDefinition>>,
    tasks: DashMap<(String, u32), Arc<TaskDefinition>>,
    actions: DashMap<(String, u32), Arc<ActionDefinition>>,
    model_profiles: DashMap<String, Arc<ModelProfile>>,
    prompt_specs: DashMap<String, Arc<PromptSpec>>,
    runs: DashMap<String, Run>,
}

impl InMemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_workflow(&self, wf: WorkflowDefinition) {
        self.workflows.insert((wf.id.clone(), wf.version), Arc::new(wf));
    }

    pub fn register_task(&self, task: TaskDefinition) {
        self.tasks.insert((task.id.clone(), task.version), Arc::new(task));
    }

    pub fn register_action(&self, action: ActionDefinition) {
        self.actions.insert((action.id.clone(), action.version), Arc::new(action));
    }

    pub fn register_model_profile(&self, profile: ModelProfile) {
        self.model_profiles.insert(profile.id.clone(), Arc::new(profile));
    }

    pub fn register_prompt_spec(&self, spec: PromptSpec) {
        self.prompt_specs.insert(spec.id.clone(), Arc::new(spec));
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        self.workflows.iter().map(|e| e.key().0.clone()).collect()
    }
}

#[async_trait]
impl ResourceService for InMemoryResources {
    async fn workflow(&self, id: &str, version: u32) -> Result<Arc<WorkflowDefinition>, ResourceError> {
        self.workflows
            .get(&(id.to_string(), version))
            .map(|e| e.value().clone())
            .ok_or_else(|| ResourceError::not_found("workflow", id))
    }

    async fn task(&self, id: &str, version: u32) -> Result<Arc<TaskDefinition>, ResourceError> {
        self.tasks
            .get(&(id.to_string(), version))
            .map(|e| e.value().clone())
            .ok_or_else(|| ResourceError::not_found("task", id))
    }

    async fn action(&self, id: &str, version: u32) -> Result<Arc<ActionDefinition>, ResourceError> {
        self.actions
            .get(&(id.to_string(), version))
            .map(|e| e.value().clone())
            .ok_or_else(|| ResourceError::not_found("action", id))
    }

    async fn model_profile(&self, id: &str) -> Result<Arc<ModelProfile>, ResourceError> {
        self.model_profiles
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ResourceError::not_found("model profile", id))
    }

    async fn prompt_spec(&self, id: &str) -> Result<Arc<PromptSpec>, ResourceError> {
        self.prompt_specs
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ResourceError::not_found("prompt spec", id))
    }

    async fn create_run(
        &self,
        workflow_id: &str,
        workflow_version: u32,
        input: Value,
        link: RunLink,
    ) -> Result<Run, ResourceError> {
        let run_id = Uuid::new_v4().to_string();
        let run = Run {
            run_id: run_id.clone(),
            workflow_id: workflow_id.to_string(),
            workflow_version,
            input,
            parent_run_id: link.parent_run_id,
            parent_token_id: link.parent_token_id,
            root_run_id: link.root_run_id.unwrap_or_else(|| run_id.clone()),
            status: RunStatus::Running,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.runs.insert(run_id, run.clone());
        Ok(run)
    }

    async fn update_run(&self, run: &Run) -> Result<(), ResourceError> {
        self.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn run(&self, run_id: &str) -> Result<Run, ResourceError> {
        self.runs
            .get(run_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ResourceError::not_found("run", run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_workflow() -> WorkflowDefinition {
        serde_yaml::from_str(
            "id: wf\ninitialNodeRef: a\nnodes:\n  - ref: a\n    taskId: t\n",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn lookup_round_trip() {
        let res = InMemoryResources::new();
        res.register_workflow(sample_workflow());
        let wf = res.workflow("wf", 1).await.unwrap();
        assert_eq!(wf.initial_node_ref, "a");
        assert!(matches!(
            res.workflow("wf", 2).await,
            Err(ResourceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn create_run_assigns_root_when_absent() {
        let res = InMemoryResources::new();
        let run = res
            .create_run("wf", 1, serde_json::json!({}), RunLink::default())
            .await
            .unwrap();
        assert_eq!(run.root_run_id, run.run_id);
        assert_eq!(run.status, RunStatus::Running);

        let child = res
            .create_run(
                "wf",
                1,
                serde_json::json!({}),
                RunLink {
                    root_run_id: Some(run.run_id.clone()),
                    parent_run_id: Some(run.run_id.clone()),
                    parent_token_id: Some("t0".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(child.root_run_id, run.run_id);
        assert!(child.is_child());
        assert_ne!(child.run_id, run.run_id);
    }

    #[tokio::test]
    async fn update_run_persists_status() {
        let res = InMemoryResources::new();
        let mut run = res
            .create_run("wf", 1, serde_json::json!({}), RunLink::default())
            .await
            .unwrap();
        run.status = RunStatus::Completed;
        run.output = Some(serde_json::json!({ "ok": true }));
        res.update_run(&run).await.unwrap();
        let fetched = res.run(&run.run_id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Completed);
    }
}
