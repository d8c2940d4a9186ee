//! Workflow engine core: definition parsing, dependency graph, and concurrent execution.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/save
//! - `dag` -- step graph, cycle detection, eligibility and skip queries
//! - `context` -- shared run context with per-step output tracking
//! - `ledger` -- per-run step status bookkeeping for the scheduler
//! - `step_runner` -- one agent call under a timeout
//! - `executor` -- semaphore-bounded DAG executor

pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod ledger;
pub mod step_runner;

pub use dag::StepGraph;
pub use definition::{Workflow, WorkflowError};
pub use executor::{DagExecutor, ExecutorError, WorkflowExecutor};
