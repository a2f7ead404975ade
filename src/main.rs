//! `weft` CLI: run workflows, validate definitions, execute test suites.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use weft::backend::MockBackend;
use weft::engine::Engine;
use weft::error::WeftError;
use weft::loader;
use weft::resource::InMemoryResources;
use weft::run::RunStatus;
use weft::testspec;

#[derive(Parser)]
#[command(name = "weft", version, about = "Graph-structured workflow execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log filter, e.g. "weft=debug".
    #[arg(long, global = true)]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow from a definitions file or directory.
    Run {
        /// Bundle file or workspace directory.
        path: PathBuf,

        /// Workflow id; optional when the workspace has exactly one.
        #[arg(long)]
        workflow: Option<String>,

        /// Workflow version.
        #[arg(long, default_value_t = 1)]
        version: u32,

        /// Inline JSON input.
        #[arg(long, default_value = "{}")]
        input: String,

        /// Print the run's trace events.
        #[arg(long)]
        trace: bool,
    },

    /// Check definitions and print every error and warning.
    Validate {
        /// Bundle file or workspace directory.
        path: PathBuf,
    },

    /// Run YAML test suites (*.test.yaml) against a workspace.
    Test {
        /// Suite file, or directory of suites and definitions.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = cli
        .log
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::from_default_env());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let outcome = match cli.command {
        Command::Run { path, workflow, version, input, trace } => {
            cmd_run(&path, workflow, version, &input, trace).await
        }
        Command::Validate { path } => cmd_validate(&path),
        Command::Test { path } => cmd_test(&path).await,
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            if let Some(hint) = e.downcast_ref::<WeftError>().and_then(WeftError::hint) {
                eprintln!("  {} {}", "hint:".yellow(), hint);
            }
            std::process::exit(1);
        }
    }
}

async fn cmd_run(
    path: &Path,
    workflow: Option<String>,
    version: u32,
    input: &str,
    trace: bool,
) -> Result<i32> {
    let resources = Arc::new(InMemoryResources::new());
    let summary = loader::load(path, &resources).map_err(WeftError::from)?;
    print_reports(&summary);
    if !summary.is_valid() {
        return Err(anyhow!("definitions did not validate"));
    }

    let workflow_id = match workflow {
        Some(id) => id,
        None => {
            let mut ids = resources.workflow_ids();
            ids.sort();
            match ids.as_slice() {
                [only] => only.clone(),
                [] => return Err(anyhow!("no workflows in {}", path.display())),
                many => {
                    return Err(anyhow!(
                        "{} workflows found, pick one with --workflow: {}",
                        many.len(),
                        many.join(", ")
                    ))
                }
            }
        }
    };

    let input: Value = serde_json::from_str(input).context("--input is not valid JSON")?;
    let engine = Engine::new(resources, Arc::new(MockBackend::new()));
    let run = engine
        .run_to_completion(&workflow_id, version, input)
        .await
        .map_err(WeftError::from)?;

    if trace {
        for event in engine.emitter().events(&run.run_id) {
            println!(
                "{:>6} {} {}",
                event.seq,
                event.kind.name().dimmed(),
                serde_json::to_string(&event.kind).unwrap_or_default()
            );
        }
    }

    match run.status {
        RunStatus::Completed => {
            println!(
                "{}",
                serde_json::to_string_pretty(&run.output.unwrap_or(Value::Null))?
            );
            Ok(0)
        }
        status => {
            eprintln!(
                "{} run {} finished as {:?}: {}",
                "error:".red().bold(),
                run.run_id,
                status,
                run.error.as_deref().unwrap_or("no detail")
            );
            Ok(1)
        }
    }
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let resources = Arc::new(InMemoryResources::new());
    let summary = loader::load(path, &resources).context("failed to load definitions")?;
    print_reports(&summary);
    println!(
        "{} workflows, {} tasks, {} actions, {} model profiles, {} prompt specs",
        summary.workflows, summary.tasks, summary.actions, summary.model_profiles, summary.prompt_specs
    );
    if summary.is_valid() {
        println!("{}", "valid".green().bold());
        Ok(0)
    } else {
        println!("{}", "invalid".red().bold());
        Ok(1)
    }
}

fn print_reports(summary: &loader::LoadSummary) {
    for file in &summary.reports {
        for issue in &file.report.errors {
            eprintln!("{} {}: {}", "error".red().bold(), file.path.display(), issue);
        }
        for issue in &file.report.warnings {
            eprintln!("{} {}: {}", "warning".yellow(), file.path.display(), issue);
        }
    }
}

async fn cmd_test(path: &Path) -> Result<i32> {
    let resources = Arc::new(InMemoryResources::new());
    let mut suites: Vec<(PathBuf, testspec::TestSuite)> = Vec::new();

    if path.is_dir() {
        let summary = loader::load_dir(path, &resources).context("failed to load definitions")?;
        if !summary.is_valid() {
            print_reports(&summary);
            return Err(anyhow!("definitions did not validate"));
        }
        for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().is_file()
                && (name.ends_with(".test.yaml") || name.ends_with(".test.yml"))
            {
                let suite = testspec::load_suite(entry.path()).map_err(|e| anyhow!(e))?;
                suites.push((entry.path().to_path_buf(), suite));
            }
        }
    } else {
        // A lone suite file; definitions live beside it.
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let summary = loader::load_dir(parent, &resources)?;
            if !summary.is_valid() {
                print_reports(&summary);
                return Err(anyhow!("definitions did not validate"));
            }
        }
        let suite = testspec::load_suite(path).map_err(|e| anyhow!(e))?;
        suites.push((path.to_path_buf(), suite));
    }

    if suites.iter().all(|(_, s)| s.tests.is_empty()) {
        return Err(anyhow!("no tests found under {}", path.display()));
    }

    let engine = Engine::new(resources, Arc::new(MockBackend::new()));
    let mut passed = 0usize;
    let mut failed = 0usize;

    for (suite_path, suite) in &suites {
        println!("{}", suite_path.display().to_string().bold());
        for outcome in testspec::run_suite(&engine, suite).await {
            if outcome.passed() {
                passed += 1;
                println!("  {} {}", "PASS".green().bold(), outcome.name);
            } else {
                failed += 1;
                println!("  {} {}", "FAIL".red().bold(), outcome.name);
                for failure in &outcome.failures {
                    println!("       {}", failure);
                }
            }
        }
    }

    println!();
    println!(
        "{} passed, {} failed",
        passed.to_string().green(),
        if failed > 0 {
            failed.to_string().red().to_string()
        } else {
            failed.to_string()
        }
    );
    Ok(if failed == 0 { 0 } else { 1 })
}
