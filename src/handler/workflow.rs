//! `workflow` handler: start a child run and suspend the calling token.
//!
//! The handler creates the child through the [`SubworkflowSpawner`] seam and
//! returns `success: true` with a `waiting` marker. The executor stops
//! iterating steps and the coordinator parks the token in `waiting` until
//! the child run terminates.

use serde_json::Value;

use crate::action::WorkflowImplementation;
use crate::resource::RunLink;

use super::{parse_impl, ActionEnv, ActionResult, SubworkflowSpawner};

pub async fn execute(
    implementation: &Value,
    input: Value,
    spawner: &dyn SubworkflowSpawner,
    env: &ActionEnv,
) -> ActionResult {
    let imp: WorkflowImplementation = match parse_impl(implementation, "workflow") {
        Ok(imp) => imp,
        Err(fail) => return *fail,
    };

    let link = RunLink {
        root_run_id: Some(env.root_run_id.clone()),
        parent_run_id: Some(env.run_id.clone()),
        parent_token_id: Some(env.token_id.clone()),
    };

    match spawner
        .spawn(&imp.workflow_id, imp.workflow_version, input, link)
        .await
    {
        Ok(child_run_id) => ActionResult::suspended(child_run_id, imp.timeout_ms),
        Err(message) => ActionResult::permanent(
            format!("failed to start sub-workflow '{}': {}", imp.workflow_id, message),
            "subworkflow_start_failed",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingSpawner {
        calls: Mutex<Vec<(String, Value, RunLink)>>,
        fail: bool,
    }

    #[async_trait]
    impl SubworkflowSpawner for RecordingSpawner {
        async fn spawn(
            &self,
            workflow_id: &str,
            _workflow_version: Option<u32>,
            input: Value,
            link: RunLink,
        ) -> Result<String, String> {
            if self.fail {
                return Err("resource service down".to_string());
            }
            self.calls
                .lock()
                .unwrap()
                .push((workflow_id.to_string(), input, link));
            Ok("child-run-1".to_string())
        }
    }

    fn env() -> ActionEnv {
        ActionEnv {
            run_id: "parent-run".into(),
            root_run_id: "root-run".into(),
            token_id: "t3".into(),
        }
    }

    #[tokio::test]
    async fn returns_waiting_with_child_id() {
        let spawner = RecordingSpawner { calls: Mutex::new(vec![]), fail: false };
        let imp = json!({ "workflowId": "child-wf", "timeoutMs": 5000 });

        let result = execute(&imp, json!({ "x": 5 }), &spawner, &env()).await;
        assert!(result.success);
        let waiting = result.waiting.unwrap();
        assert_eq!(waiting.kind, "subworkflow");
        assert_eq!(waiting.child_run_id, "child-run-1");
        assert_eq!(waiting.timeout_ms, Some(5000));

        let calls = spawner.calls.lock().unwrap();
        let (wf, input, link) = &calls[0];
        assert_eq!(wf, "child-wf");
        assert_eq!(input, &json!({ "x": 5 }));
        assert_eq!(link.root_run_id.as_deref(), Some("root-run"));
        assert_eq!(link.parent_run_id.as_deref(), Some("parent-run"));
        assert_eq!(link.parent_token_id.as_deref(), Some("t3"));
    }

    #[tokio::test]
    async fn spawn_failure_is_permanent() {
        let spawner = RecordingSpawner { calls: Mutex::new(vec![]), fail: true };
        let imp = json!({ "workflowId": "child-wf" });
        let result = execute(&imp, json!({}), &spawner, &env()).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(!error.retryable);
        assert_eq!(error.code.as_deref(), Some("subworkflow_start_failed"));
    }
}
