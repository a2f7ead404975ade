//! Run records: one per workflow execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// A single execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: String,

    pub workflow_id: String,

    pub workflow_version: u32,

    /// Frozen at creation.
    pub input: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<String>,

    pub root_run_id: String,

    pub status: RunStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Terminal error surface for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Whether this run was started by another run.
    pub fn is_child(&self) -> bool {
        self.parent_run_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn serializes_camel_case() {
        let run = Run {
            run_id: "r1".into(),
            workflow_id: "wf".into(),
            workflow_version: 1,
            input: serde_json::json!({}),
            parent_run_id: None,
            parent_token_id: None,
            root_run_id: "r1".into(),
            status: RunStatus::Running,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        let v = serde_json::to_value(&run).unwrap();
        assert_eq!(v["runId"], serde_json::json!("r1"));
        assert_eq!(v["status"], serde_json::json!("running"));
        assert!(v.get("parentRunId").is_none());
    }
}
