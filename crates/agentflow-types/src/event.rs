//! Events published by the execution engine while a workflow runs.
//!
//! Subscribers (CLI progress output, tests) receive these through the
//! broadcast `EventBus` in `agentflow-core`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::WorkflowStatus;

/// Progress notification for one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        workflow_id: String,
        total_steps: usize,
    },
    StepStarted {
        run_id: Uuid,
        step_id: String,
        agent_id: String,
    },
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
    },
    StepSkipped {
        run_id: Uuid,
        step_id: String,
        reason: String,
    },
    RunFinished {
        run_id: Uuid,
        workflow_id: String,
        status: WorkflowStatus,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::StepStarted { run_id, .. }
            | WorkflowEvent::StepCompleted { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. }
            | WorkflowEvent::StepSkipped { run_id, .. }
            | WorkflowEvent::RunFinished { run_id, .. } => *run_id,
        }
    }
}
