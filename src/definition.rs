//! # Workflow Definitions
//!
//! The immutable data model for a workflow graph: nodes reference tasks or
//! sub-workflows, transitions are the directed edges between them. Wire
//! names are camelCase; definitions usually arrive from YAML via the
//! workspace loader.
//!
//! ```yaml
//! id: review-pipeline
//! initialNodeRef: fetch
//! nodes:
//!   - ref: fetch
//!     taskId: fetch-sources
//!   - ref: review
//!     taskId: review-one
//! transitions:
//!   - fromNodeRef: fetch
//!     toNodeRef: review
//!     foreach: "output.sources"
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_version() -> u32 {
    1
}

/// Immutable workflow graph, identified by `(id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub initial_node_ref: String,

    pub nodes: Vec<Node>,

    /// Ordered: declaration order breaks priority ties.
    #[serde(default)]
    pub transitions: Vec<Transition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_schema: Option<Value>,

    /// Evaluated over the aggregated node outputs at completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mapping: Option<Map<String, Value>>,
}

impl WorkflowDefinition {
    /// Look a node up by ref.
    pub fn node(&self, node_ref: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_ref == node_ref)
    }

    /// Outgoing transitions of a node, sorted by priority (declaration
    /// order breaks ties because the sort is stable).
    pub fn outgoing(&self, node_ref: &str) -> Vec<(usize, &Transition)> {
        let mut edges: Vec<(usize, &Transition)> = self
            .transitions
            .iter()
            .enumerate()
            .filter(|(_, t)| t.from_node_ref == node_ref)
            .collect();
        edges.sort_by_key(|(_, t)| t.priority);
        edges
    }
}

/// A vertex in the workflow graph: the unit of work.
///
/// Exactly one of `taskId` / `subworkflowId` must be set; definition
/// validation enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(rename = "ref")]
    pub node_ref: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_version: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subworkflow_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subworkflow_version: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mapping: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mapping: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_bindings: Option<Map<String, Value>>,

    /// Upper bound on a referenced sub-workflow, from this node's view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// What a node resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeTarget {
    Task { id: String, version: u32 },
    Subworkflow { id: String, version: u32 },
}

impl Node {
    /// The node's target, when well-formed.
    pub fn target(&self) -> Option<NodeTarget> {
        match (&self.task_id, &self.subworkflow_id) {
            (Some(id), None) => Some(NodeTarget::Task {
                id: id.clone(),
                version: self.task_version.unwrap_or(1),
            }),
            (None, Some(id)) => Some(NodeTarget::Subworkflow {
                id: id.clone(),
                version: self.subworkflow_version.unwrap_or(1),
            }),
            _ => None,
        }
    }
}

/// A directed edge. Lower `priority` evaluates first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from_node_ref: String,

    pub to_node_ref: String,

    #[serde(default)]
    pub priority: i32,

    /// Guard expression; absent means always taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Produce this many child tokens. Mutually exclusive with `foreach`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_count: Option<u32>,

    /// Expression yielding an array (or object) to fan out over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<Synchronization>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
}

/// Join spec: the downstream token is created only once every listed
/// upstream ref has arrived.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Synchronization {
    pub wait_for: Vec<String>,
}

/// Loop budget for cyclic graphs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    #[serde(alias = "max_iterations")]
    pub max_iterations: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_yaml() -> &'static str {
        r#"
id: pipeline
initialNodeRef: a
nodes:
  - ref: a
    taskId: produce
  - ref: b
    taskId: consume
transitions:
  - fromNodeRef: a
    toNodeRef: b
    priority: 5
  - fromNodeRef: a
    toNodeRef: b
    priority: 1
    condition: "output.retry == true"
"#
    }

    #[test]
    fn parses_camel_case_yaml() {
        let wf: WorkflowDefinition = serde_yaml::from_str(two_node_yaml()).unwrap();
        assert_eq!(wf.id, "pipeline");
        assert_eq!(wf.version, 1);
        assert_eq!(wf.initial_node_ref, "a");
        assert_eq!(wf.nodes.len(), 2);
        assert_eq!(
            wf.node("a").unwrap().target(),
            Some(NodeTarget::Task { id: "produce".into(), version: 1 })
        );
    }

    #[test]
    fn outgoing_sorts_by_priority() {
        let wf: WorkflowDefinition = serde_yaml::from_str(two_node_yaml()).unwrap();
        let edges = wf.outgoing("a");
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].1.priority, 1);
        assert!(edges[0].1.condition.is_some());
    }

    #[test]
    fn node_with_both_targets_is_malformed() {
        let node: Node = serde_yaml::from_str(
            "ref: x\ntaskId: t\nsubworkflowId: w\n",
        )
        .unwrap();
        assert_eq!(node.target(), None);
    }

    #[test]
    fn loop_config_accepts_snake_alias() {
        let t: Transition = serde_yaml::from_str(
            "fromNodeRef: a\ntoNodeRef: a\nloopConfig:\n  max_iterations: 4\n",
        )
        .unwrap();
        assert_eq!(t.loop_config.unwrap().max_iterations, 4);
    }
}
