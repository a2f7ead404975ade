//! # Engine
//!
//! Owns the pieces every run shares: the resource service, the LLM backend,
//! the trace emitter, the stateless executor, and the registry of live
//! coordinators. Starting a workflow validates its definition, creates a
//! run record, and spawns a coordinator loop; sub-workflows re-enter
//! through the same path with parent linkage.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, Weak};
use thiserror::Error;

use crate::backend::LlmBackend;
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::event::Emitter;
use crate::executor::Executor;
use crate::handler::{ActionDispatcher, SubworkflowSpawner};
use crate::resource::{ResourceError, ResourceService, RunLink};
use crate::run::Run;
use crate::validate;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("invalid workflow definition:\n{0}")]
    InvalidDefinition(String),

    #[error("run '{0}' not found")]
    UnknownRun(String),

    #[error("coordinator for run '{0}' terminated without a result")]
    CoordinatorLost(String),
}

/// State shared between the engine facade and every coordinator.
pub struct Shared {
    pub(crate) resources: Arc<dyn ResourceService>,
    pub(crate) emitter: Arc<Emitter>,
    pub(crate) registry: DashMap<String, CoordinatorHandle>,
    pub(crate) executor: Arc<Executor>,
}

impl Shared {
    /// Create a run record and its coordinator. The caller decides when to
    /// send `start`.
    pub(crate) fn spawn_run(
        self: Arc<Self>,
        workflow_id: &str,
        workflow_version: Option<u32>,
        input: Value,
        link: RunLink,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<CoordinatorHandle, EngineError>> + Send>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            let version = workflow_version.unwrap_or(1);
            let workflow = self.resources.workflow(&workflow_id, version).await?;

            let report = validate::check(&workflow);
            if !report.is_valid() {
                return Err(EngineError::InvalidDefinition(report.to_string()));
            }

            let run = self
                .resources
                .create_run(&workflow_id, version, input, link)
                .await?;
            let run_id = run.run_id.clone();

            let (coordinator, handle) = Coordinator::new(run, workflow, self.clone());
            self.registry.insert(run_id, handle.clone());
            tokio::spawn(coordinator.run_loop());
            Ok(handle)
        })
    }
}

/// Spawner seam handed to the `workflow` action handler. Holds the engine
/// weakly: the executor lives inside [`Shared`], so a strong reference
/// would cycle.
struct EngineSpawner {
    shared: Weak<Shared>,
}

#[async_trait::async_trait]
impl SubworkflowSpawner for EngineSpawner {
    async fn spawn(
        &self,
        workflow_id: &str,
        workflow_version: Option<u32>,
        input: Value,
        link: RunLink,
    ) -> Result<String, String> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| "engine has shut down".to_string())?;
        // The child is created but not started: the parent coordinator
        // starts it after parking the calling token in `waiting`, so the
        // child's terminal callback can never race the suspension.
        let handle = shared
            .spawn_run(workflow_id, workflow_version, input, link)
            .await
            .map_err(|e| e.to_string())?;
        Ok(handle.run_id().to_string())
    }
}

/// The public facade.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Shared>,
}

impl Engine {
    pub fn new(resources: Arc<dyn ResourceService>, backend: Arc<dyn LlmBackend>) -> Self {
        let emitter = Arc::new(Emitter::new());
        let inner = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let spawner = Arc::new(EngineSpawner { shared: weak.clone() });
            let dispatcher = ActionDispatcher::new(resources.clone(), backend, spawner);
            let executor = Arc::new(Executor::new(resources.clone(), dispatcher, emitter.clone()));
            Shared {
                resources,
                emitter,
                registry: DashMap::new(),
                executor,
            }
        });
        Self { inner }
    }

    pub fn emitter(&self) -> Arc<Emitter> {
        self.inner.emitter.clone()
    }

    pub fn resources(&self) -> Arc<dyn ResourceService> {
        self.inner.resources.clone()
    }

    /// Start a workflow run; returns immediately with the coordinator
    /// handle.
    pub async fn start_run(
        &self,
        workflow_id: &str,
        workflow_version: u32,
        input: Value,
    ) -> Result<CoordinatorHandle, EngineError> {
        let handle = self
            .inner
            .clone()
            .spawn_run(workflow_id, Some(workflow_version), input, RunLink::default())
            .await?;
        handle.start();
        Ok(handle)
    }

    /// Start a run and wait for its terminal record.
    pub async fn run_to_completion(
        &self,
        workflow_id: &str,
        workflow_version: u32,
        input: Value,
    ) -> Result<Run, EngineError> {
        let handle = self.start_run(workflow_id, workflow_version, input).await?;
        let run_id = handle.run_id().to_string();
        handle
            .wait_terminal()
            .await
            .ok_or(EngineError::CoordinatorLost(run_id))
    }

    /// Handle of a live (or recently terminal) run.
    pub fn handle(&self, run_id: &str) -> Option<CoordinatorHandle> {
        self.inner.registry.get(run_id).map(|e| e.value().clone())
    }

    /// Cancel a run and its descendants.
    pub fn cancel(&self, run_id: &str) -> Result<(), EngineError> {
        match self.inner.registry.get(run_id) {
            Some(handle) => {
                handle.cancel();
                Ok(())
            }
            None => Err(EngineError::UnknownRun(run_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionDefinition, ActionKind};
    use crate::backend::MockBackend;
    use crate::resource::InMemoryResources;
    use crate::run::RunStatus;
    use crate::task::TaskDefinition;
    use serde_json::json;

    fn hello_world_resources() -> Arc<InMemoryResources> {
        let res = Arc::new(InMemoryResources::new());
        res.register_action(ActionDefinition {
            id: "pass".into(),
            version: 1,
            kind: ActionKind::Context,
            implementation: json!({}),
        });
        let task: TaskDefinition = serde_yaml::from_str(
            "id: greet\nsteps:\n  - { ref: only, ordinal: 0, actionId: pass }\n",
        )
        .unwrap();
        res.register_task(task);
        res.register_workflow(
            serde_yaml::from_str(
                "id: hello\ninitialNodeRef: start\nnodes:\n  - ref: start\n    taskId: greet\n",
            )
            .unwrap(),
        );
        res
    }

    #[tokio::test]
    async fn run_to_completion_round_trip() {
        let engine = Engine::new(hello_world_resources(), Arc::new(MockBackend::new()));
        let run = engine
            .run_to_completion("hello", 1, json!({ "name": "World" }))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!({ "name": "World" })));
    }

    #[tokio::test]
    async fn unknown_workflow_errors() {
        let engine = Engine::new(hello_world_resources(), Arc::new(MockBackend::new()));
        let err = engine.run_to_completion("ghost", 1, json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::Resource(_)));
    }

    #[tokio::test]
    async fn invalid_definition_rejected_before_start() {
        let res = hello_world_resources();
        res.register_workflow(
            serde_yaml::from_str(
                "id: broken\ninitialNodeRef: ghost\nnodes:\n  - ref: start\n    taskId: greet\n",
            )
            .unwrap(),
        );
        let engine = Engine::new(res, Arc::new(MockBackend::new()));
        let err = engine.run_to_completion("broken", 1, json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));
    }

    #[tokio::test]
    async fn cancel_unknown_run_errors() {
        let engine = Engine::new(hello_world_resources(), Arc::new(MockBackend::new()));
        assert!(matches!(
            engine.cancel("nope"),
            Err(EngineError::UnknownRun(_))
        ));
    }
}

