//! # Trace Emitter
//!
//! Append-only trace events keyed by run. Events are ordered by the
//! coordinator's serialization (a per-run monotonic sequence id); the engine
//! does not guarantee global timestamp monotonicity. Transport (WebSocket
//! fan-out) is out of scope; consumers read snapshots through
//! [`Emitter::events`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// One trace event: `{ seq, timestamp, kind, payload }` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Monotonic within a run.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event kinds, tagged with dotted wire names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload")]
pub enum EventKind {
    #[serde(rename = "run.started")]
    RunStarted { workflow_id: String },

    #[serde(rename = "run.completed")]
    RunCompleted { output: Value },

    #[serde(rename = "run.failed")]
    RunFailed { error: String },

    #[serde(rename = "run.cancelled")]
    RunCancelled,

    #[serde(rename = "coordinator.token.created")]
    TokenCreated { token_id: String, node_ref: String },

    #[serde(rename = "coordinator.token.dispatched")]
    TokenDispatched { token_id: String, node_ref: String },

    #[serde(rename = "coordinator.retry.scheduled")]
    RetryScheduled { token_id: String, attempt: u32, delay_ms: u64 },

    #[serde(rename = "coordinator.join.fired")]
    JoinFired { to_node_ref: String, join_key: String },

    #[serde(rename = "coordinator.join.discarded")]
    JoinDiscarded { to_node_ref: String, join_key: String, node_ref: String },

    #[serde(rename = "executor.task.started")]
    TaskStarted { token_id: String, task_id: String },

    #[serde(rename = "executor.task.completed")]
    TaskCompleted { token_id: String, task_id: String },

    #[serde(rename = "executor.task.failed")]
    TaskFailed { token_id: String, task_id: String, error: String },

    #[serde(rename = "executor.step.skipped")]
    StepSkipped { token_id: String, step_ref: String },

    #[serde(rename = "executor.step.failed")]
    StepFailed { token_id: String, step_ref: String, message: String },

    #[serde(rename = "subworkflow.started")]
    SubworkflowStarted { token_id: String, child_run_id: String },

    #[serde(rename = "subworkflow.resumed")]
    SubworkflowResumed { token_id: String, child_run_id: String },
}

impl EventKind {
    /// The dotted wire name.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RunStarted { .. } => "run.started",
            EventKind::RunCompleted { .. } => "run.completed",
            EventKind::RunFailed { .. } => "run.failed",
            EventKind::RunCancelled => "run.cancelled",
            EventKind::TokenCreated { .. } => "coordinator.token.created",
            EventKind::TokenDispatched { .. } => "coordinator.token.dispatched",
            EventKind::RetryScheduled { .. } => "coordinator.retry.scheduled",
            EventKind::JoinFired { .. } => "coordinator.join.fired",
            EventKind::JoinDiscarded { .. } => "coordinator.join.discarded",
            EventKind::TaskStarted { .. } => "executor.task.started",
            EventKind::TaskCompleted { .. } => "executor.task.completed",
            EventKind::TaskFailed { .. } => "executor.task.failed",
            EventKind::StepSkipped { .. } => "executor.step.skipped",
            EventKind::StepFailed { .. } => "executor.step.failed",
            EventKind::SubworkflowStarted { .. } => "subworkflow.started",
            EventKind::SubworkflowResumed { .. } => "subworkflow.resumed",
        }
    }
}

#[derive(Default)]
struct RunTrace {
    next_seq: AtomicU64,
    events: RwLock<Vec<TraceEvent>>,
}

/// Thread-safe trace sink shared by coordinators and executors.
#[derive(Default)]
pub struct Emitter {
    traces: DashMap<String, RunTrace>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to a run's trace; returns its sequence id.
    pub fn emit(&self, run_id: &str, kind: EventKind) -> u64 {
        let trace = self.traces.entry(run_id.to_string()).or_default();
        let seq = trace.next_seq.fetch_add(1, Ordering::SeqCst);
        trace.events.write().push(TraceEvent {
            seq,
            timestamp: Utc::now(),
            kind,
        });
        seq
    }

    /// Snapshot of a run's events, in sequence order.
    pub fn events(&self, run_id: &str) -> Vec<TraceEvent> {
        self.traces
            .get(run_id)
            .map(|t| t.events.read().clone())
            .unwrap_or_default()
    }

    /// Events of one wire kind, for assertions.
    pub fn of_kind(&self, run_id: &str, name: &str) -> Vec<TraceEvent> {
        self.events(run_id)
            .into_iter()
            .filter(|e| e.kind.name() == name)
            .collect()
    }

    pub fn len(&self, run_id: &str) -> usize {
        self.traces.get(run_id).map(|t| t.events.read().len()).unwrap_or(0)
    }

    pub fn is_empty(&self, run_id: &str) -> bool {
        self.len(run_id) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequences_are_per_run_monotonic() {
        let emitter = Emitter::new();
        let a0 = emitter.emit("a", EventKind::RunStarted { workflow_id: "wf".into() });
        let a1 = emitter.emit("a", EventKind::RunCancelled);
        let b0 = emitter.emit("b", EventKind::RunStarted { workflow_id: "wf".into() });
        assert_eq!((a0, a1, b0), (0, 1, 0));
        assert_eq!(emitter.len("a"), 2);
        assert_eq!(emitter.len("b"), 1);
    }

    #[test]
    fn filter_by_wire_name() {
        let emitter = Emitter::new();
        emitter.emit("r", EventKind::TaskStarted { token_id: "t0".into(), task_id: "x".into() });
        emitter.emit("r", EventKind::TaskCompleted { token_id: "t0".into(), task_id: "x".into() });
        assert_eq!(emitter.of_kind("r", "executor.task.completed").len(), 1);
        assert_eq!(emitter.of_kind("r", "executor.task.failed").len(), 0);
    }

    #[test]
    fn wire_format_has_kind_and_payload() {
        let event = TraceEvent {
            seq: 0,
            timestamp: Utc::now(),
            kind: EventKind::RunCompleted { output: json!({ "x": 1 }) },
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["kind"], json!("run.completed"));
        assert_eq!(v["payload"]["output"]["x"], json!(1));
    }
}
