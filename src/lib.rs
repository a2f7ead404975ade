//! # Weft
//!
//! A workflow execution engine for declarative, graph-structured workflows.
//! A workflow is a directed graph of *nodes* referencing *tasks*; tasks are
//! ordered *steps*; steps invoke typed *actions* (LLM calls, HTTP requests,
//! context transforms, sub-workflows, mocks). Execution passes *tokens*
//! between nodes under a per-run coordinator.
//!
//! ## Architecture
//!
//! | Layer | Module | Role |
//! |-------|--------|------|
//! | Expressions | [`expr`] | paths, arithmetic, logic for mappings and guards |
//! | Mappings | [`mapping`] | declarative context-to-context translation |
//! | Conditions | [`condition`] | step guards with four outcomes |
//! | Handlers | [`handler`] | kind-specific action execution, uniform result |
//! | Executor | [`executor`] | stateless task runner |
//! | Coordinator | [`coordinator`] | per-run token state machine |
//! | Engine | [`engine`] | wiring, run registry, sub-workflow spawning |
//! | Emitter | [`event`] | append-only per-run trace |
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use weft::{backend::MockBackend, engine::Engine, resource::InMemoryResources};
//!
//! let resources = Arc::new(InMemoryResources::new());
//! weft::loader::load_dir("./workspace".as_ref(), &resources)?;
//!
//! let engine = Engine::new(resources, Arc::new(MockBackend::new()));
//! let run = engine
//!     .run_to_completion("hello", 1, serde_json::json!({ "name": "World" }))
//!     .await?;
//! println!("{:?} {:?}", run.status, run.output);
//! # Ok::<(), weft::error::WeftError>(())
//! ```
//!
//! ## Two sub-languages
//!
//! Mapping values and conditions use the expression language ([`expr`]);
//! LLM prompt strings use the template renderer ([`template`]). They are
//! deliberately separate: one computes values, the other interpolates
//! strings.

pub mod action;
pub mod backend;
pub mod condition;
pub mod context;
pub mod coordinator;
pub mod definition;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod expr;
pub mod handler;
pub mod loader;
pub mod mapping;
pub mod resource;
pub mod run;
pub mod schema;
pub mod task;
pub mod template;
pub mod testspec;
pub mod validate;

pub use action::{ActionDefinition, ActionKind};
pub use backend::{LlmBackend, MockBackend};
pub use condition::{ConditionOutcome, StepCondition};
pub use coordinator::{CoordinatorHandle, TokenStatus};
pub use definition::{Node, Transition, WorkflowDefinition};
pub use engine::{Engine, EngineError};
pub use error::WeftError;
pub use event::{Emitter, EventKind, TraceEvent};
pub use executor::{TaskErrorInfo, TaskPayload};
pub use handler::{ActionResult, Waiting};
pub use resource::{InMemoryResources, ModelProfile, PromptSpec, ResourceService};
pub use run::{Run, RunStatus};
pub use task::{RetryPolicy, Step, TaskDefinition};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn library_surface_smoke_test() {
        let resources = Arc::new(InMemoryResources::new());
        resources.register_action(ActionDefinition {
            id: "pass".into(),
            version: 1,
            kind: ActionKind::Context,
            implementation: json!({}),
        });
        resources.register_task(
            serde_yaml::from_str(
                "id: greet\nsteps:\n  - { ref: only, ordinal: 0, actionId: pass }\n",
            )
            .unwrap(),
        );
        resources.register_workflow(
            serde_yaml::from_str(
                "id: hello\ninitialNodeRef: start\nnodes:\n  - { ref: start, taskId: greet }\n",
            )
            .unwrap(),
        );

        let engine = Engine::new(resources, Arc::new(MockBackend::new()));
        let run = engine
            .run_to_completion("hello", 1, json!({ "name": "World" }))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!({ "name": "World" })));
    }
}
