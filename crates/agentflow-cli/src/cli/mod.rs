//! CLI command definitions for the `agentflow` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod plan;
pub mod run;
pub mod validate;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;

use agentflow_core::workflow::{Workflow, WorkflowError};

/// Run multi-agent workflows defined in YAML.
#[derive(Parser)]
#[command(name = "agentflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for progress and info logs, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow file.
    Run {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Initial context as a JSON object.
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read the initial context from a JSON file.
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Override the workflow's concurrency limit.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Override the workflow deadline, in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Write the final workflow state snapshot to this path.
        #[arg(long)]
        state_out: Option<PathBuf>,
    },

    /// Check a workflow file for parse and dependency errors.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Show the dependency levels a workflow would run in.
    Plan {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Global output flags, passed to every handler.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
    pub verbose: u8,
}

/// Load and validate a workflow file with user-facing error messages.
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    Workflow::load(path).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow::anyhow!("Failed to parse workflow YAML: {msg}"),
        WorkflowError::ValidationError(msg) => anyhow::anyhow!("Workflow validation failed: {msg}"),
        WorkflowError::IoError(err) => {
            anyhow::anyhow!("Failed to read {}: {err}", path.display())
        }
        other => anyhow::anyhow!("Invalid workflow: {other}"),
    })
}
