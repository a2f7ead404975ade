//! # Action Definitions
//!
//! An action is a typed unit of work. The `kind` set is closed; the
//! `implementation` object is kind-specific and deserialized by the
//! matching handler.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

fn default_version() -> u32 {
    1
}

/// Immutable action, identified by `(id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    pub id: String,

    #[serde(default = "default_version")]
    pub version: u32,

    pub kind: ActionKind,

    /// Kind-specific configuration, parsed by the handler.
    #[serde(default)]
    pub implementation: Value,
}

/// The closed set of action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Llm,
    Http,
    Mcp,
    Human,
    Context,
    Artifact,
    Workflow,
    Vector,
    Metric,
    Mock,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Llm => "llm",
            ActionKind::Http => "http",
            ActionKind::Mcp => "mcp",
            ActionKind::Human => "human",
            ActionKind::Context => "context",
            ActionKind::Artifact => "artifact",
            ActionKind::Workflow => "workflow",
            ActionKind::Vector => "vector",
            ActionKind::Metric => "metric",
            ActionKind::Mock => "mock",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// KIND-SPECIFIC IMPLEMENTATION OBJECTS
// ============================================================================

/// `llm` implementation. Exactly one of `promptSpecId` / `promptTemplate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmImplementation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_spec_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,

    pub model_profile_id: String,
}

/// `context` implementation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContextImplementation {
    /// Absent means passthrough.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<ContextMerge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMerge {
    /// Field the merged value lands under.
    pub target: String,

    /// Expressions resolved against the action input.
    pub sources: Vec<String>,

    #[serde(default)]
    pub policy: MergePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// Spread array sources, push scalars.
    #[default]
    Flatten,
    /// First array source seeds; later sources append as single elements.
    Append,
}

/// `mock` implementation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MockImplementation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<MockDelay>,

    /// Seeded generation is deterministic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockDelay {
    #[serde(default)]
    pub min_ms: u64,
    pub max_ms: u64,
}

/// `workflow` implementation: invoke a child run and suspend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowImplementation {
    pub workflow_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_version: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// `http` implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpImplementation {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}
