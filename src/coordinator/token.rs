//! Tokens: the unit of scheduling.
//!
//! A token is a record in the coordinator's `HashMap<TokenId, Token>`;
//! lineage is by parent id, never by pointer, so cyclic workflow graphs
//! stay representable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Token lifecycle.
///
/// ```text
/// pending ──dispatch──► executing ──result──► completed
///                          │                      └─► (fan-out children)
///                          ├─ retryable, attempts left ─► pending
///                          ├─ error ─► failed
///                          └─ action.waiting ─► waiting ─► completed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Pending,
    Executing,
    Waiting,
    Completed,
    Failed,
    Skipped,
}

impl TokenStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TokenStatus::Completed | TokenStatus::Failed | TokenStatus::Skipped
        )
    }

    /// Legal transitions; anything else is a coordinator bug.
    pub fn can_transition_to(&self, next: TokenStatus) -> bool {
        use TokenStatus::*;
        matches!(
            (self, next),
            (Pending, Executing)
                | (Pending, Skipped)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Waiting)
                | (Executing, Pending)
                | (Waiting, Completed)
                | (Waiting, Failed)
        )
    }
}

/// "Control arrived at node `node_ref` with this context."
#[derive(Debug, Clone)]
pub struct Token {
    pub token_id: String,

    /// Creation order; the ready set drains in this order.
    pub seq: u64,

    pub node_ref: String,

    pub status: TokenStatus,

    /// Run-context input for this token (parent output plus fan-out
    /// metadata); the node's input mapping applies at dispatch.
    pub input: Value,

    pub output: Option<Value>,

    pub parent_token_ids: Vec<String>,

    /// Position within a `spawnCount`/`foreach` fan-out.
    pub spawn_index: Option<usize>,

    pub foreach_item: Option<Value>,

    /// Set while suspended on a child run.
    pub child_run_id: Option<String>,

    pub retry_attempt: u32,

    /// Join-key lineage: the nearest fan-out ancestor's index, `""` at the
    /// root.
    pub join_key: String,

    /// Traversal counts per transition index, for loop budgets.
    pub loop_counts: HashMap<usize, u32>,
}

impl Token {
    pub fn new(token_id: String, seq: u64, node_ref: String, input: Value) -> Self {
        Self {
            token_id,
            seq,
            node_ref,
            status: TokenStatus::Pending,
            input,
            output: None,
            parent_token_ids: Vec::new(),
            spawn_index: None,
            foreach_item: None,
            child_run_id: None,
            retry_attempt: 0,
            join_key: String::new(),
            loop_counts: HashMap::new(),
        }
    }
}
