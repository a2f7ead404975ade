//! # Workspace Loader
//!
//! Reads definition bundles from YAML files. A bundle document may carry
//! any mix of workflows, tasks, actions, model profiles, and prompt specs:
//!
//! ```yaml
//! workflows:
//!   - id: hello
//!     initialNodeRef: start
//!     nodes:
//!       - { ref: start, taskId: greet }
//! tasks:
//!   - id: greet
//!     steps:
//!       - { ref: only, ordinal: 0, actionId: pass }
//! actions:
//!   - { id: pass, kind: context }
//! ```
//!
//! Loading validates every definition and registers the valid ones into an
//! [`InMemoryResources`] registry; per-file reports surface errors and
//! warnings without aborting the walk.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::action::ActionDefinition;
use crate::definition::WorkflowDefinition;
use crate::resource::{InMemoryResources, ModelProfile, PromptSpec};
use crate::task::TaskDefinition;
use crate::validate::{self, ValidationReport};

/// One YAML document's worth of definitions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,

    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,

    #[serde(default)]
    pub actions: Vec<ActionDefinition>,

    #[serde(default)]
    pub model_profiles: Vec<ModelProfile>,

    #[serde(default)]
    pub prompt_specs: Vec<PromptSpec>,
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path}: YAML parse error: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("glob pattern error: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Validation findings for one file.
#[derive(Debug)]
pub struct FileReport {
    pub path: PathBuf,
    pub report: ValidationReport,
}

/// What a load run found and registered.
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub workflows: usize,
    pub tasks: usize,
    pub actions: usize,
    pub model_profiles: usize,
    pub prompt_specs: usize,
    pub reports: Vec<FileReport>,
}

impl LoadSummary {
    /// No definition carried validation errors.
    pub fn is_valid(&self) -> bool {
        self.reports.iter().all(|f| f.report.is_valid())
    }

    fn absorb(&mut self, other: LoadSummary) {
        self.workflows += other.workflows;
        self.tasks += other.tasks;
        self.actions += other.actions;
        self.model_profiles += other.model_profiles;
        self.prompt_specs += other.prompt_specs;
        self.reports.extend(other.reports);
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Test-suite files are not definition bundles.
fn is_test_spec(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".test.yaml") || n.ends_with(".test.yml"))
}

/// Load a single bundle file.
pub fn load_file(path: &Path, resources: &InMemoryResources) -> Result<LoadSummary, LoaderError> {
    let text = std::fs::read_to_string(path)?;
    let bundle: Bundle = serde_yaml::from_str(&text).map_err(|source| LoaderError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "loaded bundle");

    let mut summary = LoadSummary::default();
    let mut report = ValidationReport::default();

    for workflow in bundle.workflows {
        report.extend(validate::check(&workflow));
        resources.register_workflow(workflow);
        summary.workflows += 1;
    }
    for task in bundle.tasks {
        report.extend(validate::check_task(&task));
        resources.register_task(task);
        summary.tasks += 1;
    }
    for action in bundle.actions {
        resources.register_action(action);
        summary.actions += 1;
    }
    for profile in bundle.model_profiles {
        resources.register_model_profile(profile);
        summary.model_profiles += 1;
    }
    for spec in bundle.prompt_specs {
        resources.register_prompt_spec(spec);
        summary.prompt_specs += 1;
    }

    summary.reports.push(FileReport { path: path.to_path_buf(), report });
    Ok(summary)
}

/// Walk a directory tree, loading every non-test YAML file.
pub fn load_dir(dir: &Path, resources: &InMemoryResources) -> Result<LoadSummary, LoaderError> {
    let mut summary = LoadSummary::default();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| LoaderError::Io(e.into()))?;
        let path = entry.path();
        if entry.file_type().is_file() && is_yaml(path) && !is_test_spec(path) {
            summary.absorb(load_file(path, resources)?);
        }
    }
    Ok(summary)
}

/// Load everything matching a glob pattern.
pub fn load_pattern(pattern: &str, resources: &InMemoryResources) -> Result<LoadSummary, LoaderError> {
    let mut summary = LoadSummary::default();
    for path in glob::glob(pattern)?.flatten() {
        if path.is_file() && is_yaml(&path) && !is_test_spec(&path) {
            summary.absorb(load_file(&path, resources)?);
        }
    }
    Ok(summary)
}

/// Load a path of either shape.
pub fn load(path: &Path, resources: &InMemoryResources) -> Result<LoadSummary, LoaderError> {
    if path.is_dir() {
        load_dir(path, resources)
    } else {
        load_file(path, resources)
    }
}
