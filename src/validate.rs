//! # Definition Validation
//!
//! Structural checks over workflow and task definitions, reported with
//! stable codes so tooling and users can match on them:
//!
//! | Range | Layer |
//! |-------|-------|
//! | WEFT-0xx | workflow graph shape |
//! | WEFT-1xx | task and step shape |
//! | WEFT-2xx | reachability and join warnings |
//!
//! Errors block execution; warnings print but do not.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use crate::definition::WorkflowDefinition;
use crate::expr::{self, Expr, Seg};
use crate::task::TaskDefinition;

/// One finding, with its stable code.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub code: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Errors and warnings for one definition.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, code: &'static str, message: String) {
        self.errors.push(ValidationIssue { code, message });
    }

    fn warn(&mut self, code: &'static str, message: String) {
        self.warnings.push(ValidationIssue { code, message });
    }

    /// Merge another report into this one.
    pub fn extend(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for issue in &self.errors {
            writeln!(f, "error {}", issue)?;
        }
        for issue in &self.warnings {
            writeln!(f, "warning {}", issue)?;
        }
        Ok(())
    }
}

/// Validate a workflow graph.
pub fn check(workflow: &WorkflowDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut refs = HashSet::new();
    for node in &workflow.nodes {
        if !refs.insert(node.node_ref.as_str()) {
            report.error(
                "WEFT-002",
                format!("duplicate node ref '{}'", node.node_ref),
            );
        }
        if node.target().is_none() {
            report.error(
                "WEFT-003",
                format!(
                    "node '{}' must reference exactly one of taskId or subworkflowId",
                    node.node_ref
                ),
            );
        }
    }

    if !refs.contains(workflow.initial_node_ref.as_str()) {
        report.error(
            "WEFT-001",
            format!("initialNodeRef '{}' is not a node", workflow.initial_node_ref),
        );
    }

    for (i, transition) in workflow.transitions.iter().enumerate() {
        if !refs.contains(transition.from_node_ref.as_str()) {
            report.error(
                "WEFT-010",
                format!("transition {} fromNodeRef '{}' is not a node", i, transition.from_node_ref),
            );
        }
        if !refs.contains(transition.to_node_ref.as_str()) {
            report.error(
                "WEFT-011",
                format!("transition {} toNodeRef '{}' is not a node", i, transition.to_node_ref),
            );
        }
        if transition.spawn_count.is_some() && transition.foreach.is_some() {
            report.error(
                "WEFT-012",
                format!("transition {} sets both spawnCount and foreach", i),
            );
        }
        if transition.spawn_count == Some(0) {
            report.error("WEFT-013", format!("transition {} spawnCount must be >= 1", i));
        }
        if let Some(sync) = &transition.synchronization {
            for awaited in &sync.wait_for {
                if !refs.contains(awaited.as_str()) {
                    report.error(
                        "WEFT-014",
                        format!("transition {} waits for unknown node '{}'", i, awaited),
                    );
                }
            }
        }
    }

    let reachable = check_reachability(workflow, &mut report);
    check_output_mapping_refs(workflow, &reachable, &mut report);
    check_join_origins(workflow, &mut report);
    report
}

fn check_reachability<'a>(
    workflow: &'a WorkflowDefinition,
    report: &mut ValidationReport,
) -> HashSet<&'a str> {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for t in &workflow.transitions {
        edges.entry(t.from_node_ref.as_str()).or_default().push(t.to_node_ref.as_str());
        // A join's awaited refs feed the target even without a direct edge.
        if let Some(sync) = &t.synchronization {
            for awaited in &sync.wait_for {
                edges.entry(awaited.as_str()).or_default().push(t.to_node_ref.as_str());
            }
        }
    }

    let mut reachable = HashSet::new();
    let mut queue = VecDeque::from([workflow.initial_node_ref.as_str()]);
    while let Some(current) = queue.pop_front() {
        if !reachable.insert(current) {
            continue;
        }
        for &next in edges.get(current).into_iter().flatten() {
            queue.push_back(next);
        }
    }

    for node in &workflow.nodes {
        if !reachable.contains(node.node_ref.as_str()) {
            report.warn(
                "WEFT-020",
                format!("node '{}' is unreachable from '{}'", node.node_ref, workflow.initial_node_ref),
            );
        }
    }
    reachable
}

/// Every node an `outputMapping` expression names must be reachable, or
/// the mapping can never see its output.
fn check_output_mapping_refs(
    workflow: &WorkflowDefinition,
    reachable: &HashSet<&str>,
    report: &mut ValidationReport,
) {
    let Some(output_mapping) = &workflow.output_mapping else { return };

    for (target, raw) in output_mapping {
        let Some(src) = raw.as_str() else { continue };
        let Ok(parsed) = expr::parse(src) else {
            report.warn(
                "WEFT-021",
                format!("outputMapping '{}' does not parse: {}", target, src),
            );
            continue;
        };
        for node_ref in referenced_nodes(&parsed) {
            if !reachable.contains(node_ref.as_str()) {
                report.warn(
                    "WEFT-021",
                    format!(
                        "outputMapping '{}' references node '{}' which is unknown or unreachable",
                        target, node_ref
                    ),
                );
            }
        }
    }
}

/// Collect `nodes.<ref>` path heads from an expression tree.
fn referenced_nodes(expr: &Expr) -> Vec<String> {
    let mut found = Vec::new();
    collect_nodes(expr, &mut found);
    found
}

fn collect_nodes(expr: &Expr, found: &mut Vec<String>) {
    match expr {
        Expr::Path(segs) => {
            if let [Seg::Key(head), Seg::Key(node_ref), ..] = segs.as_slice() {
                if head == "nodes" {
                    found.push(node_ref.clone());
                }
            }
        }
        Expr::Unary(_, inner) => collect_nodes(inner, found),
        Expr::Binary(_, lhs, rhs) => {
            collect_nodes(lhs, found);
            collect_nodes(rhs, found);
        }
        Expr::Call(_, args) => {
            for arg in args {
                collect_nodes(arg, found);
            }
        }
        Expr::Literal(_) => {}
    }
}

/// Joins over refs fed by unrelated foreach fan-outs share the root join
/// key and rarely mean what the author intended.
fn check_join_origins(workflow: &WorkflowDefinition, report: &mut ValidationReport) {
    let foreach_targets: HashMap<&str, usize> = workflow
        .transitions
        .iter()
        .enumerate()
        .filter(|(_, t)| t.foreach.is_some())
        .map(|(i, t)| (t.to_node_ref.as_str(), i))
        .collect();

    for (i, transition) in workflow.transitions.iter().enumerate() {
        let Some(sync) = &transition.synchronization else { continue };
        let origins: HashSet<usize> = sync
            .wait_for
            .iter()
            .filter_map(|r| foreach_targets.get(r.as_str()).copied())
            .collect();
        if origins.len() > 1 {
            report.warn(
                "WEFT-203",
                format!(
                    "transition {} joins refs fed by {} independent foreach fan-outs; they share one join key",
                    i,
                    origins.len()
                ),
            );
        }
    }
}

/// Validate a task definition.
pub fn check_task(task: &TaskDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut refs = HashSet::new();
    for step in &task.steps {
        if !refs.insert(step.step_ref.as_str()) {
            report.error(
                "WEFT-102",
                format!("task '{}' has duplicate step ref '{}'", task.id, step.step_ref),
            );
        }
    }

    let mut ordinals: Vec<u32> = task.steps.iter().map(|s| s.ordinal).collect();
    ordinals.sort_unstable();
    let contiguous = ordinals.iter().enumerate().all(|(i, &o)| o == i as u32);
    if !contiguous {
        report.error(
            "WEFT-101",
            format!("task '{}' step ordinals must be contiguous from 0, got {:?}", task.id, ordinals),
        );
    }

    if let Some(retry) = &task.retry {
        if retry.max_attempts == 0 {
            report.error(
                "WEFT-103",
                format!("task '{}' retry.maxAttempts must be >= 1", task.id),
            );
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf(yaml: &str) -> WorkflowDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn clean_workflow_passes() {
        let report = check(&wf(r#"
id: ok
initialNodeRef: a
nodes:
  - { ref: a, taskId: t }
  - { ref: b, taskId: t }
transitions:
  - { fromNodeRef: a, toNodeRef: b }
"#));
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn missing_initial_ref() {
        let report = check(&wf(r#"
id: bad
initialNodeRef: ghost
nodes:
  - { ref: a, taskId: t }
"#));
        assert!(report.errors.iter().any(|e| e.code == "WEFT-001"));
    }

    #[test]
    fn duplicate_refs_and_double_target() {
        let report = check(&wf(r#"
id: bad
initialNodeRef: a
nodes:
  - { ref: a, taskId: t }
  - { ref: a, taskId: t, subworkflowId: w }
"#));
        assert!(report.errors.iter().any(|e| e.code == "WEFT-002"));
        assert!(report.errors.iter().any(|e| e.code == "WEFT-003"));
    }

    #[test]
    fn transition_ref_checks() {
        let report = check(&wf(r#"
id: bad
initialNodeRef: a
nodes:
  - { ref: a, taskId: t }
transitions:
  - { fromNodeRef: ghost, toNodeRef: a }
  - { fromNodeRef: a, toNodeRef: ghost }
  - { fromNodeRef: a, toNodeRef: a, spawnCount: 2, foreach: "output.items" }
  - { fromNodeRef: a, toNodeRef: a, spawnCount: 0 }
"#));
        let codes: Vec<&str> = report.errors.iter().map(|e| e.code).collect();
        assert!(codes.contains(&"WEFT-010"));
        assert!(codes.contains(&"WEFT-011"));
        assert!(codes.contains(&"WEFT-012"));
        assert!(codes.contains(&"WEFT-013"));
    }

    #[test]
    fn unreachable_node_warns() {
        let report = check(&wf(r#"
id: warn
initialNodeRef: a
nodes:
  - { ref: a, taskId: t }
  - { ref: orphan, taskId: t }
"#));
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.code == "WEFT-020"));
    }

    #[test]
    fn output_mapping_unknown_node_warns() {
        let report = check(&wf(r#"
id: warn
initialNodeRef: a
nodes:
  - { ref: a, taskId: t }
outputMapping:
  result: "nodes.ghost.value"
"#));
        assert!(report.warnings.iter().any(|w| w.code == "WEFT-021"));
    }

    #[test]
    fn independent_foreach_join_warns() {
        let report = check(&wf(r#"
id: warn
initialNodeRef: a
nodes:
  - { ref: a, taskId: t }
  - { ref: b, taskId: t }
  - { ref: c, taskId: t }
  - { ref: d, taskId: t }
transitions:
  - { fromNodeRef: a, toNodeRef: b, foreach: "output.xs" }
  - { fromNodeRef: a, toNodeRef: c, foreach: "output.ys" }
  - fromNodeRef: b
    toNodeRef: d
    synchronization:
      waitFor: [b, c]
"#));
        assert!(report.warnings.iter().any(|w| w.code == "WEFT-203"));
    }

    #[test]
    fn task_ordinal_and_ref_checks() {
        let task: TaskDefinition = serde_yaml::from_str(r#"
id: t
steps:
  - { ref: a, ordinal: 0, actionId: x }
  - { ref: a, ordinal: 2, actionId: x }
"#).unwrap();
        let report = check_task(&task);
        let codes: Vec<&str> = report.errors.iter().map(|e| e.code).collect();
        assert!(codes.contains(&"WEFT-101"));
        assert!(codes.contains(&"WEFT-102"));
    }
}
