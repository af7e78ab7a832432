//! `flowrun` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — validate a workflow definition JSON file.
//! - `plan`     — print the staged execution plan for a workflow file.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use engine::{ExecutionPlan, Workflow};

#[derive(Parser)]
#[command(
    name = "flowrun",
    about = "Staged, bounded-concurrency workflow execution engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Show the staged execution plan for a workflow definition.
    Plan {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
}

fn load_workflow(path: &PathBuf) -> anyhow::Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let workflow: Workflow =
        serde_json::from_str(&content).context("workflow file is not valid JSON")?;
    Ok(workflow)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let workflow = load_workflow(&path)?;
            match engine::validate(&workflow) {
                Ok(()) => {
                    println!(
                        "workflow '{}' is valid ({} nodes, {} edges)",
                        workflow.name,
                        workflow.nodes.len(),
                        workflow.edges.len()
                    );
                }
                Err(e) => {
                    eprintln!("validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Plan { path } => {
            let workflow = load_workflow(&path)?;
            match ExecutionPlan::build(&workflow) {
                Ok(plan) => {
                    for (idx, stage) in plan.stages().iter().enumerate() {
                        println!("stage {idx}: {}", stage.join(", "));
                    }
                }
                Err(e) => {
                    eprintln!("planning failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
