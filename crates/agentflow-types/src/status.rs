//! Lifecycle status enums for workflows, steps, and agents.
//!
//! Each enum encodes its own legal transition graph through the [`Lifecycle`]
//! trait so the state store can reject illegal moves uniformly.
//!
//! ```text
//! workflow: pending -> running -> {completed, failed, cancelled}
//! step:     pending -> running -> {completed, failed, skipped}
//!           pending -> skipped
//! agent:    initialized -> idle -> running -> {idle, failed}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Shared behaviour of every status enum tracked by the state store.
pub trait Lifecycle:
    Copy + Eq + Default + fmt::Debug + fmt::Display + Serialize + Send + Sync + 'static
{
    /// Entity kind used in error messages ("workflow", "step", "agent").
    const ENTITY: &'static str;

    /// Whether `self -> next` is an edge of the status graph.
    fn can_transition_to(self, next: Self) -> bool;

    /// Whether no further transition is allowed out of this status.
    fn is_terminal(self) -> bool;

    /// Canonical lowercase name, identical to the serialized form.
    fn as_str(self) -> &'static str;

    /// Whether entering this status marks the start of active work.
    fn is_running(self) -> bool;
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Lifecycle for WorkflowStatus {
    const ENTITY: &'static str = "workflow";

    fn can_transition_to(self, next: Self) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    fn is_running(self) -> bool {
        self == WorkflowStatus::Running
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

impl Default for WorkflowStatus {
    fn default() -> Self {
        WorkflowStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Status of a single step within a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl Lifecycle for StepStatus {
    const ENTITY: &'static str = "step";

    fn can_transition_to(self, next: Self) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Skipped)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    fn is_running(self) -> bool {
        self == StepStatus::Running
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        StepStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Status of an agent within one workflow run.
///
/// `Failed` is terminal for the run: a failed agent is never dispatched again
/// until the workflow is re-initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initialized,
    Idle,
    Running,
    Failed,
}

impl Lifecycle for AgentStatus {
    const ENTITY: &'static str = "agent";

    fn can_transition_to(self, next: Self) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Initialized, Idle) | (Idle, Running) | (Running, Idle) | (Running, Failed)
        )
    }

    fn is_terminal(self) -> bool {
        self == AgentStatus::Failed
    }

    fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Initialized => "initialized",
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Failed => "failed",
        }
    }

    fn is_running(self) -> bool {
        self == AgentStatus::Running
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initialized" => Ok(AgentStatus::Initialized),
            "idle" => Ok(AgentStatus::Idle),
            "running" => Ok(AgentStatus::Running),
            "failed" => Ok(AgentStatus::Failed),
            other => Err(format!("invalid agent status: '{other}'")),
        }
    }
}

impl Default for AgentStatus {
    fn default() -> Self {
        AgentStatus::Initialized
    }
}
