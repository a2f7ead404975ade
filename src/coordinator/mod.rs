//! # Coordinator
//!
//! One coordinator instance owns one run: its token graph, join table, and
//! terminal status. Every state mutation happens on a single cooperative
//! loop consuming an inbox channel; work (executor invocations, child runs,
//! timers) runs off-loop in spawned tasks and re-enters through the
//! [`CoordinatorHandle`].
//!
//! Inbox events: `Start`, `MarkExecuting`, `TaskResult`, `TaskError`,
//! `RetryDue`, `SubworkflowTimeout`, `Cancel`. The loop exits once the run
//! reaches a terminal status; late callbacks are accepted by the channel
//! and dropped unprocessed.

mod join;
mod token;

pub use join::{JoinOutcome, JoinTable};
pub use token::{Token, TokenStatus};

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::context::{keys, FanoutMeta};
use crate::definition::{NodeTarget, Transition, WorkflowDefinition};
use crate::engine::Shared;
use crate::event::EventKind;
use crate::executor::{TaskErrorInfo, TaskPayload};
use crate::expr;
use crate::mapping;
use crate::resource::RunLink;
use crate::run::{Run, RunStatus};
use crate::schema;

/// Everything that can re-enter the coordinator loop.
#[derive(Debug)]
pub enum CoordinatorEvent {
    Start,
    MarkExecuting { token_id: String },
    TaskResult { token_id: String, output: Value },
    TaskError { token_id: String, error: TaskErrorInfo },
    RetryDue { token_id: String },
    SubworkflowTimeout { token_id: String, child_run_id: String },
    Cancel,
}

/// Clonable sender half of a coordinator: the RPC surface consumed by the
/// executor, parent/child coordinators, and the engine.
#[derive(Clone)]
pub struct CoordinatorHandle {
    run_id: String,
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
    completion: watch::Receiver<Option<Run>>,
}

impl CoordinatorHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Begin execution; idempotent.
    pub fn start(&self) {
        let _ = self.tx.send(CoordinatorEvent::Start);
    }

    /// Executor ack that a task payload was received.
    pub fn mark_token_executing(&self, token_id: &str) {
        let _ = self.tx.send(CoordinatorEvent::MarkExecuting { token_id: token_id.to_string() });
    }

    /// Deliver a successful task (or child-run) outcome.
    pub fn handle_task_result(&self, token_id: &str, output: Value) {
        let _ = self.tx.send(CoordinatorEvent::TaskResult {
            token_id: token_id.to_string(),
            output,
        });
    }

    /// Deliver a task (or child-run) failure.
    pub fn handle_task_error(&self, token_id: &str, error: TaskErrorInfo) {
        let _ = self.tx.send(CoordinatorEvent::TaskError {
            token_id: token_id.to_string(),
            error,
        });
    }

    /// Cancel this run and its descendants.
    pub fn cancel(&self) {
        let _ = self.tx.send(CoordinatorEvent::Cancel);
    }

    /// Wait for the run's terminal record. `None` only if the coordinator
    /// vanished without reaching a terminal state.
    pub async fn wait_terminal(&self) -> Option<Run> {
        let mut rx = self.completion.clone();
        loop {
            {
                let current = rx.borrow();
                if let Some(run) = current.as_ref() {
                    return Some(run.clone());
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

/// Per-run state machine.
pub struct Coordinator {
    run: Run,
    workflow: Arc<WorkflowDefinition>,
    shared: Arc<Shared>,

    tokens: HashMap<String, Token>,
    next_token: u64,
    join_table: JoinTable,
    /// Expected join arrivals per (group key, node ref), tracked at token
    /// creation so joins know the fan-out width.
    arrival_quota: HashMap<(String, String), usize>,
    /// Outputs of completed tokens per node ref, in completion order.
    node_outputs: HashMap<String, Vec<Value>>,

    inbox: mpsc::UnboundedReceiver<CoordinatorEvent>,
    handle: CoordinatorHandle,
    completion_tx: watch::Sender<Option<Run>>,

    started: bool,
    terminal: bool,
}

impl Coordinator {
    pub fn new(run: Run, workflow: Arc<WorkflowDefinition>, shared: Arc<Shared>) -> (Self, CoordinatorHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = watch::channel(None);
        let handle = CoordinatorHandle {
            run_id: run.run_id.clone(),
            tx,
            completion: completion_rx,
        };
        let coordinator = Self {
            run,
            workflow,
            shared,
            tokens: HashMap::new(),
            next_token: 0,
            join_table: JoinTable::new(),
            arrival_quota: HashMap::new(),
            node_outputs: HashMap::new(),
            inbox,
            handle: handle.clone(),
            completion_tx,
            started: false,
            terminal: false,
        };
        (coordinator, handle)
    }

    /// Consume the inbox until the run terminates.
    pub async fn run_loop(mut self) {
        while let Some(event) = self.inbox.recv().await {
            self.handle_event(event).await;
            if self.terminal {
                break;
            }
        }
        debug!(run = %self.run.run_id, "coordinator loop exited");
    }

    async fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Start => self.on_start().await,
            CoordinatorEvent::MarkExecuting { token_id } => {
                debug!(run = %self.run.run_id, token = %token_id, "executor acked dispatch");
            }
            CoordinatorEvent::TaskResult { token_id, output } => {
                self.on_task_result(token_id, output).await
            }
            CoordinatorEvent::TaskError { token_id, error } => {
                self.on_task_error(token_id, error).await
            }
            CoordinatorEvent::RetryDue { token_id } => self.on_retry_due(token_id).await,
            CoordinatorEvent::SubworkflowTimeout { token_id, child_run_id } => {
                self.on_subworkflow_timeout(token_id, child_run_id).await
            }
            CoordinatorEvent::Cancel => self.on_cancel().await,
        }
    }

    // ========================================================================
    // START
    // ========================================================================

    async fn on_start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        info!(run = %self.run.run_id, workflow = %self.run.workflow_id, "run started");
        self.shared.emitter.emit(
            &self.run.run_id,
            EventKind::RunStarted { workflow_id: self.run.workflow_id.clone() },
        );

        let workflow = self.workflow.clone();
        if let Some(input_schema) = &workflow.input_schema {
            if let Err(e) = schema::validate(input_schema, &self.run.input) {
                self.fail_run(format!("run input: {}", e)).await;
                return;
            }
        }

        let input = self.token_input_from(self.run.input.clone(), None);
        let initial_ref = self.workflow.initial_node_ref.clone();
        self.create_token(initial_ref, input, Vec::new(), None, None, String::new(), HashMap::new());
        self.drain_ready().await;
    }

    /// Wrap a value into a token input object carrying `@root` and optional
    /// fan-out metadata.
    fn token_input_from(&self, value: Value, meta: Option<&FanoutMeta>) -> Value {
        let mut map = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        map.insert(keys::ROOT.to_string(), self.run.input.clone());
        if let Some(meta) = meta {
            meta.apply(&mut map);
        }
        Value::Object(map)
    }

    // ========================================================================
    // TOKEN LIFECYCLE
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn create_token(
        &mut self,
        node_ref: String,
        input: Value,
        parent_token_ids: Vec<String>,
        spawn_index: Option<usize>,
        foreach_item: Option<Value>,
        join_key: String,
        loop_counts: HashMap<usize, u32>,
    ) -> String {
        let token_id = format!("t{}", self.next_token);
        let mut token = Token::new(token_id.clone(), self.next_token, node_ref.clone(), input);
        self.next_token += 1;
        token.parent_token_ids = parent_token_ids;
        token.spawn_index = spawn_index;
        token.foreach_item = foreach_item;
        token.join_key = join_key.clone();
        token.loop_counts = loop_counts;

        *self.arrival_quota.entry((join_key, node_ref.clone())).or_insert(0) += 1;

        self.shared.emitter.emit(
            &self.run.run_id,
            EventKind::TokenCreated { token_id: token_id.clone(), node_ref },
        );
        self.tokens.insert(token_id.clone(), token);
        token_id
    }

    fn set_status(&mut self, token_id: &str, next: TokenStatus) -> bool {
        let Some(token) = self.tokens.get_mut(token_id) else {
            warn!(run = %self.run.run_id, token = %token_id, "status change for unknown token");
            return false;
        };
        if !token.status.can_transition_to(next) {
            warn!(
                run = %self.run.run_id,
                token = %token_id,
                from = ?token.status,
                to = ?next,
                "illegal token transition dropped"
            );
            return false;
        }
        token.status = next;
        true
    }

    async fn drain_ready(&mut self) {
        loop {
            if self.terminal {
                return;
            }
            let mut ready: Vec<(u64, String)> = self
                .tokens
                .values()
                .filter(|t| t.status == TokenStatus::Pending)
                .map(|t| (t.seq, t.token_id.clone()))
                .collect();
            if ready.is_empty() {
                return;
            }
            ready.sort();
            for (_, token_id) in ready {
                self.dispatch_token(&token_id).await;
                if self.terminal {
                    return;
                }
            }
        }
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    async fn dispatch_token(&mut self, token_id: &str) {
        let Some(token) = self.tokens.get(token_id) else { return };
        if token.status != TokenStatus::Pending {
            return;
        }
        let node_ref = token.node_ref.clone();
        let token_input = token.input.clone();
        let retry_attempt = token.retry_attempt;

        let Some(node) = self.workflow.node(&node_ref).cloned() else {
            self.fail_run(format!("token '{}' references undefined node '{}'", token_id, node_ref))
                .await;
            return;
        };
        let Some(target) = node.target() else {
            self.fail_run(format!(
                "node '{}' must reference exactly one of a task or a sub-workflow",
                node_ref
            ))
            .await;
            return;
        };

        // The node's input mapping applies here, at dispatch.
        let record = json!({ "input": token_input.clone(), "nodes": self.nodes_record() });
        let dispatch_input = match &node.input_mapping {
            Some(input_mapping) => match mapping::apply(input_mapping, &record) {
                Ok(mapped) => Value::Object(mapped),
                Err(e) => {
                    self.set_status(token_id, TokenStatus::Executing);
                    self.set_status(token_id, TokenStatus::Failed);
                    self.fail_run(format!("input mapping for node '{}': {}", node_ref, e)).await;
                    return;
                }
            },
            None => token_input.clone(),
        };

        match target {
            NodeTarget::Task { id, version } => {
                let task = match self.shared.resources.task(&id, version).await {
                    Ok(task) => task,
                    Err(e) => {
                        self.fail_run(e.to_string()).await;
                        return;
                    }
                };
                let payload = TaskPayload {
                    token_id: token_id.to_string(),
                    run_id: self.run.run_id.clone(),
                    root_run_id: self.run.root_run_id.clone(),
                    project_id: None,
                    task_id: id,
                    task_version: version,
                    input: dispatch_input,
                    resources: node.resource_bindings.clone().map(Value::Object),
                    timeout_ms: task.timeout_ms,
                    retry_attempt,
                    trace_enabled: true,
                };
                self.set_status(token_id, TokenStatus::Executing);
                self.shared.emitter.emit(
                    &self.run.run_id,
                    EventKind::TokenDispatched {
                        token_id: token_id.to_string(),
                        node_ref: node_ref.clone(),
                    },
                );

                let executor = self.shared.executor.clone();
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    handle.mark_token_executing(&payload.token_id);
                    let token_id = payload.token_id.clone();
                    let work = AssertUnwindSafe(async { executor.execute(&payload).await })
                        .catch_unwind();
                    let outcome = match payload.timeout_ms {
                        Some(ms) => {
                            match tokio::time::timeout(Duration::from_millis(ms), work).await {
                                Ok(outcome) => outcome,
                                Err(_) => {
                                    handle.handle_task_error(
                                        &token_id,
                                        TaskErrorInfo::timeout(format!(
                                            "task exceeded {} ms",
                                            ms
                                        )),
                                    );
                                    return;
                                }
                            }
                        }
                        None => work.await,
                    };
                    match outcome {
                        Ok(Ok(success)) => handle.handle_task_result(&token_id, success.output),
                        Ok(Err(error)) => handle.handle_task_error(&token_id, error),
                        Err(_) => handle.handle_task_error(
                            &token_id,
                            TaskErrorInfo::internal("task execution panicked"),
                        ),
                    }
                });
            }
            NodeTarget::Subworkflow { id, version } => {
                let link = RunLink {
                    root_run_id: Some(self.run.root_run_id.clone()),
                    parent_run_id: Some(self.run.run_id.clone()),
                    parent_token_id: Some(token_id.to_string()),
                };
                match self.shared.clone().spawn_run(&id, Some(version), dispatch_input, link).await {
                    Ok(child) => {
                        self.set_status(token_id, TokenStatus::Executing);
                        self.set_status(token_id, TokenStatus::Waiting);
                        if let Some(token) = self.tokens.get_mut(token_id) {
                            token.child_run_id = Some(child.run_id().to_string());
                        }
                        self.shared.emitter.emit(
                            &self.run.run_id,
                            EventKind::SubworkflowStarted {
                                token_id: token_id.to_string(),
                                child_run_id: child.run_id().to_string(),
                            },
                        );
                        child.start();
                        if let Some(ms) = node.timeout_ms {
                            self.schedule_subworkflow_timeout(token_id, child.run_id(), ms);
                        }
                    }
                    Err(e) => {
                        self.set_status(token_id, TokenStatus::Executing);
                        self.set_status(token_id, TokenStatus::Failed);
                        self.fail_run(format!("failed to start sub-workflow '{}': {}", id, e))
                            .await;
                    }
                }
            }
        }
    }

    fn schedule_subworkflow_timeout(&self, token_id: &str, child_run_id: &str, ms: u64) {
        let handle = self.handle.clone();
        let token_id = token_id.to_string();
        let child_run_id = child_run_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let _ = handle.tx.send(CoordinatorEvent::SubworkflowTimeout { token_id, child_run_id });
        });
    }

    // ========================================================================
    // RESULTS
    // ========================================================================

    async fn on_task_result(&mut self, token_id: String, output: Value) {
        if self.terminal {
            warn!(run = %self.run.run_id, token = %token_id, "result after terminal state discarded");
            return;
        }
        let Some(token) = self.tokens.get(&token_id) else {
            warn!(run = %self.run.run_id, token = %token_id, "result for unknown token discarded");
            return;
        };
        let status = token.status;
        if status != TokenStatus::Executing && status != TokenStatus::Waiting {
            warn!(run = %self.run.run_id, token = %token_id, ?status, "stale result discarded");
            return;
        }

        // A waiting marker suspends instead of completing.
        if status == TokenStatus::Executing {
            if let Some(marker) = output.get(keys::SUBWORKFLOW).cloned() {
                let child_run_id = marker
                    .get("childRunId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.set_status(&token_id, TokenStatus::Waiting);
                if let Some(token) = self.tokens.get_mut(&token_id) {
                    token.child_run_id = Some(child_run_id.clone());
                }
                self.shared.emitter.emit(
                    &self.run.run_id,
                    EventKind::SubworkflowStarted {
                        token_id: token_id.clone(),
                        child_run_id: child_run_id.clone(),
                    },
                );
                if let Some(ms) = marker.get("timeoutMs").and_then(Value::as_u64) {
                    self.schedule_subworkflow_timeout(&token_id, &child_run_id, ms);
                }
                // The handler created the child but left it idle; starting
                // it only now guarantees its terminal callback finds this
                // token already waiting.
                if let Some(child) = self.shared.registry.get(&child_run_id) {
                    child.start();
                }
                return;
            }
        }

        if status == TokenStatus::Waiting {
            let child = self
                .tokens
                .get(&token_id)
                .and_then(|t| t.child_run_id.clone())
                .unwrap_or_default();
            self.shared.emitter.emit(
                &self.run.run_id,
                EventKind::SubworkflowResumed { token_id: token_id.clone(), child_run_id: child },
            );
        }

        self.set_status(&token_id, TokenStatus::Completed);
        if let Some(token) = self.tokens.get_mut(&token_id) {
            token.output = Some(output.clone());
            let node_ref = token.node_ref.clone();
            self.node_outputs.entry(node_ref).or_default().push(output);
        }

        self.evaluate_transitions(&token_id).await;
        if self.terminal {
            return;
        }
        self.drain_ready().await;
        self.maybe_finish().await;
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    async fn evaluate_transitions(&mut self, token_id: &str) {
        let Some(token) = self.tokens.get(token_id) else { return };
        let node_ref = token.node_ref.clone();
        let token_input = token.input.clone();
        let token_output = token.output.clone().unwrap_or(Value::Null);
        let join_key = token.join_key.clone();
        let spawn_index = token.spawn_index;
        let loop_counts = token.loop_counts.clone();

        let outgoing: Vec<(usize, Transition)> = self
            .workflow
            .outgoing(&node_ref)
            .into_iter()
            .map(|(idx, t)| (idx, t.clone()))
            .collect();

        let record = json!({
            "input": token_input,
            "output": token_output.clone(),
            "nodes": self.nodes_record(),
        });

        for (idx, transition) in outgoing {
            if let Some(guard) = &transition.condition {
                let pass = match expr::evaluate(guard, &record) {
                    Ok(v) => expr::truthy(&v),
                    Err(e) => {
                        warn!(run = %self.run.run_id, guard = %guard, error = %e, "transition guard failed, treated as false");
                        false
                    }
                };
                if !pass {
                    continue;
                }
            }

            // Loop budget.
            let mut child_loop_counts = loop_counts.clone();
            if let Some(loop_config) = &transition.loop_config {
                let count = loop_counts.get(&idx).copied().unwrap_or(0) + 1;
                if count > loop_config.max_iterations {
                    self.fail_run(format!(
                        "loop budget exceeded: transition {} -> {} passed {} times (max {})",
                        transition.from_node_ref,
                        transition.to_node_ref,
                        count,
                        loop_config.max_iterations
                    ))
                    .await;
                    return;
                }
                child_loop_counts.insert(idx, count);
            }

            if let Some(sync) = &transition.synchronization {
                self.arrive_at_join(
                    idx,
                    &transition,
                    &sync.wait_for.clone(),
                    &node_ref,
                    &join_key,
                    spawn_index,
                    token_output.clone(),
                    child_loop_counts,
                    token_id,
                );
                continue;
            }

            if let Some(foreach) = &transition.foreach {
                let items: Vec<(Option<String>, Value)> = match expr::evaluate(foreach, &record) {
                    Ok(Value::Array(items)) => items.into_iter().map(|v| (None, v)).collect(),
                    Ok(Value::Object(map)) => {
                        map.into_iter().map(|(k, v)| (Some(k), v)).collect()
                    }
                    Ok(Value::Null) => Vec::new(),
                    Ok(single) => vec![(None, single)],
                    Err(e) => {
                        self.fail_run(format!(
                            "foreach expression '{}' failed: {}",
                            foreach, e
                        ))
                        .await;
                        return;
                    }
                };
                let total = items.len();
                let child_group = child_group_key(&join_key, spawn_index);
                for (i, (key, item)) in items.into_iter().enumerate() {
                    let meta = FanoutMeta { index: i, total, key, item: Some(item.clone()) };
                    let input = self.token_input_from(token_output.clone(), Some(&meta));
                    self.create_token(
                        transition.to_node_ref.clone(),
                        input,
                        vec![token_id.to_string()],
                        Some(i),
                        Some(item),
                        child_group.clone(),
                        child_loop_counts.clone(),
                    );
                }
                continue;
            }

            let spawn_count = transition.spawn_count.unwrap_or(1).max(1) as usize;
            if spawn_count > 1 {
                let child_group = child_group_key(&join_key, spawn_index);
                for i in 0..spawn_count {
                    let meta = FanoutMeta { index: i, total: spawn_count, key: None, item: None };
                    let input = self.token_input_from(token_output.clone(), Some(&meta));
                    self.create_token(
                        transition.to_node_ref.clone(),
                        input,
                        vec![token_id.to_string()],
                        Some(i),
                        None,
                        child_group.clone(),
                        child_loop_counts.clone(),
                    );
                }
            } else {
                let input = self.token_input_from(token_output.clone(), None);
                self.create_token(
                    transition.to_node_ref.clone(),
                    input,
                    vec![token_id.to_string()],
                    spawn_index,
                    None,
                    join_key.clone(),
                    child_loop_counts,
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn arrive_at_join(
        &mut self,
        transition_idx: usize,
        transition: &Transition,
        wait_for: &[String],
        node_ref: &str,
        join_key: &str,
        spawn_index: Option<usize>,
        output: Value,
        loop_counts: HashMap<usize, u32>,
        token_id: &str,
    ) {
        let mut expected = HashMap::new();
        for r in wait_for {
            let quota = self
                .arrival_quota
                .get(&(join_key.to_string(), r.clone()))
                .copied()
                .unwrap_or(1);
            expected.insert(r.clone(), quota);
        }

        match self.join_table.arrive(
            transition_idx,
            join_key,
            wait_for,
            &expected,
            node_ref,
            spawn_index,
            output,
        ) {
            JoinOutcome::Pending => {}
            JoinOutcome::AlreadyFired => {
                warn!(
                    run = %self.run.run_id,
                    node = %node_ref,
                    key = %join_key,
                    "arrival after join fired, discarded"
                );
                self.shared.emitter.emit(
                    &self.run.run_id,
                    EventKind::JoinDiscarded {
                        to_node_ref: transition.to_node_ref.clone(),
                        join_key: join_key.to_string(),
                        node_ref: node_ref.to_string(),
                    },
                );
            }
            JoinOutcome::Fired(aggregated) => {
                self.shared.emitter.emit(
                    &self.run.run_id,
                    EventKind::JoinFired {
                        to_node_ref: transition.to_node_ref.clone(),
                        join_key: join_key.to_string(),
                    },
                );
                let input = self.token_input_from(Value::Object(aggregated), None);
                self.create_token(
                    transition.to_node_ref.clone(),
                    input,
                    vec![token_id.to_string()],
                    None,
                    None,
                    join_key.to_string(),
                    loop_counts,
                );
            }
        }
    }

    /// Aggregated node outputs: single-token nodes expose the bare value,
    /// multi-token nodes the ordered list.
    fn nodes_record(&self) -> Value {
        let mut map = Map::new();
        for (node_ref, outputs) in &self.node_outputs {
            let value = if outputs.len() == 1 {
                outputs[0].clone()
            } else {
                Value::Array(outputs.clone())
            };
            map.insert(node_ref.clone(), value);
        }
        Value::Object(map)
    }

    // ========================================================================
    // ERRORS & RETRY
    // ========================================================================

    async fn on_task_error(&mut self, token_id: String, error: TaskErrorInfo) {
        if self.terminal {
            warn!(run = %self.run.run_id, token = %token_id, "error after terminal state discarded");
            return;
        }
        let Some(token) = self.tokens.get(&token_id) else {
            warn!(run = %self.run.run_id, token = %token_id, "error for unknown token discarded");
            return;
        };
        let status = token.status;
        if status != TokenStatus::Executing && status != TokenStatus::Waiting {
            warn!(run = %self.run.run_id, token = %token_id, ?status, "stale error discarded");
            return;
        }
        let node_ref = token.node_ref.clone();
        let retry_attempt = token.retry_attempt;

        if error.retryable && status == TokenStatus::Executing {
            if let Some(policy) = self.retry_policy_for(&node_ref).await {
                let next_attempt = retry_attempt + 1;
                if next_attempt < policy.max_attempts {
                    let delay = policy.delay_for(next_attempt);
                    self.shared.emitter.emit(
                        &self.run.run_id,
                        EventKind::RetryScheduled {
                            token_id: token_id.clone(),
                            attempt: next_attempt,
                            delay_ms: delay.as_millis() as u64,
                        },
                    );
                    debug!(
                        run = %self.run.run_id,
                        token = %token_id,
                        attempt = next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retry scheduled"
                    );
                    let handle = self.handle.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = handle.tx.send(CoordinatorEvent::RetryDue { token_id });
                    });
                    return;
                }
            }
        }

        self.set_status(&token_id, TokenStatus::Failed);
        self.fail_run(format!(
            "token '{}' at node '{}' failed: {}",
            token_id, node_ref, error.message
        ))
        .await;
    }

    async fn retry_policy_for(&self, node_ref: &str) -> Option<crate::task::RetryPolicy> {
        let node = self.workflow.node(node_ref)?;
        match node.target()? {
            NodeTarget::Task { id, version } => self
                .shared
                .resources
                .task(&id, version)
                .await
                .ok()
                .and_then(|task| task.retry.clone()),
            NodeTarget::Subworkflow { .. } => None,
        }
    }

    async fn on_retry_due(&mut self, token_id: String) {
        if self.terminal {
            return;
        }
        if !self.set_status(&token_id, TokenStatus::Pending) {
            return;
        }
        if let Some(token) = self.tokens.get_mut(&token_id) {
            token.retry_attempt += 1;
        }
        self.drain_ready().await;
    }

    async fn on_subworkflow_timeout(&mut self, token_id: String, child_run_id: String) {
        if self.terminal {
            return;
        }
        let still_waiting = self
            .tokens
            .get(&token_id)
            .is_some_and(|t| t.status == TokenStatus::Waiting && t.child_run_id.as_deref() == Some(&child_run_id));
        if !still_waiting {
            return;
        }
        if let Some(child) = self.shared.registry.get(&child_run_id) {
            child.cancel();
        }
        self.set_status(&token_id, TokenStatus::Failed);
        self.fail_run(format!(
            "sub-workflow '{}' timed out from token '{}'",
            child_run_id, token_id
        ))
        .await;
    }

    // ========================================================================
    // TERMINATION
    // ========================================================================

    async fn maybe_finish(&mut self) {
        if self.terminal {
            return;
        }
        let live = self
            .tokens
            .values()
            .any(|t| !t.status.is_terminal());
        if live {
            return;
        }

        let workflow = self.workflow.clone();
        let output = match &workflow.output_mapping {
            Some(output_mapping) => {
                let record = json!({ "nodes": self.nodes_record(), "input": self.run.input });
                match mapping::apply(output_mapping, &record) {
                    Ok(mapped) => Value::Object(mapped),
                    Err(e) => {
                        self.fail_run(format!("run output mapping: {}", e)).await;
                        return;
                    }
                }
            }
            // Default: the output of the last token to complete.
            None => self
                .tokens
                .values()
                .filter(|t| t.status == TokenStatus::Completed)
                .max_by_key(|t| t.seq)
                .and_then(|t| t.output.clone())
                .unwrap_or(Value::Null),
        };

        self.run.status = RunStatus::Completed;
        self.run.output = Some(output.clone());
        self.run.completed_at = Some(Utc::now());
        if let Err(e) = self.shared.resources.update_run(&self.run).await {
            warn!(run = %self.run.run_id, error = %e, "failed to persist terminal run");
        }
        info!(run = %self.run.run_id, "run completed");
        self.shared.emitter.emit(&self.run.run_id, EventKind::RunCompleted { output: output.clone() });

        if let (Some(parent_run), Some(parent_token)) =
            (self.run.parent_run_id.clone(), self.run.parent_token_id.clone())
        {
            if let Some(parent) = self.shared.registry.get(&parent_run) {
                parent.handle_task_result(&parent_token, output);
            }
        }
        self.finish_terminal();
    }

    async fn fail_run(&mut self, message: String) {
        if self.terminal {
            return;
        }
        warn!(run = %self.run.run_id, error = %message, "run failed");
        for token in self.tokens.values_mut() {
            if token.status == TokenStatus::Pending {
                token.status = TokenStatus::Skipped;
            }
        }
        self.run.status = RunStatus::Failed;
        self.run.error = Some(message.clone());
        self.run.completed_at = Some(Utc::now());
        if let Err(e) = self.shared.resources.update_run(&self.run).await {
            warn!(run = %self.run.run_id, error = %e, "failed to persist failed run");
        }
        self.shared.emitter.emit(&self.run.run_id, EventKind::RunFailed { error: message.clone() });

        if let (Some(parent_run), Some(parent_token)) =
            (self.run.parent_run_id.clone(), self.run.parent_token_id.clone())
        {
            if let Some(parent) = self.shared.registry.get(&parent_run) {
                parent.handle_task_error(
                    &parent_token,
                    TaskErrorInfo {
                        error_type: crate::executor::TaskErrorType::StepFailure,
                        step_ref: None,
                        message: format!("sub-workflow run '{}' failed: {}", self.run.run_id, message),
                        retryable: false,
                    },
                );
            }
        }
        self.finish_terminal();
    }

    async fn on_cancel(&mut self) {
        if self.terminal {
            return;
        }
        info!(run = %self.run.run_id, "run cancelled");
        let children: Vec<String> = self
            .tokens
            .values()
            .filter(|t| t.status == TokenStatus::Waiting)
            .filter_map(|t| t.child_run_id.clone())
            .collect();
        for child_run_id in children {
            if let Some(child) = self.shared.registry.get(&child_run_id) {
                child.cancel();
            }
        }
        for token in self.tokens.values_mut() {
            if token.status == TokenStatus::Pending {
                token.status = TokenStatus::Skipped;
            }
        }
        self.run.status = RunStatus::Cancelled;
        self.run.completed_at = Some(Utc::now());
        if let Err(e) = self.shared.resources.update_run(&self.run).await {
            warn!(run = %self.run.run_id, error = %e, "failed to persist cancelled run");
        }
        self.shared.emitter.emit(&self.run.run_id, EventKind::RunCancelled);
        self.finish_terminal();
    }

    fn finish_terminal(&mut self) {
        self.terminal = true;
        let _ = self.completion_tx.send(Some(self.run.clone()));
    }
}

/// Group key for children created by a fan-out: the parent's group extended
/// by the parent's own fan-out index, so siblings share a key and an outer
/// join can still tell sibling groups apart.
fn child_group_key(parent_group: &str, parent_index: Option<usize>) -> String {
    match parent_index {
        Some(idx) => format!("{}/{}", parent_group, idx),
        None => parent_group.to_string(),
    }
}
