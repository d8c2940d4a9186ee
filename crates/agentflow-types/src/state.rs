//! State records for workflows, steps, and agents.
//!
//! All three entity kinds share one generic [`StateRecord`], parameterized by
//! their status enum. Every status change goes through
//! [`StateRecord::transition`], which validates the move against the
//! [`Lifecycle`] graph and appends a [`StatusChange`] to the history before the
//! status field is mutated. Because of that ordering, `history` always
//! describes a valid path through the status graph.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::status::{AgentStatus, Lifecycle, StepStatus, WorkflowStatus};
use crate::workflow::ContextMap;

/// Lifecycle state of a workflow run.
pub type WorkflowState = StateRecord<WorkflowStatus>;

/// Lifecycle state of one step within a workflow run.
pub type StepState = StateRecord<StepStatus>;

/// Lifecycle state of one agent within a workflow run.
pub type AgentState = StateRecord<AgentStatus>;

/// One entry of a record's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange<S> {
    pub previous_status: S,
    pub new_status: S,
    pub timestamp: DateTime<Utc>,
}

/// Mutable lifecycle record tracked by the state store.
///
/// Serializes to a flat JSON mapping: timestamps as RFC 3339 text, status as
/// its canonical lowercase name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord<S> {
    pub id: String,
    pub name: String,
    pub status: S,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ContextMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<StatusChange<S>>,
}

impl<S: Lifecycle> StateRecord<S> {
    /// Create a record in the initial status of its lifecycle.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: S::default(),
            start_time: None,
            end_time: None,
            metrics: BTreeMap::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            updated_at: None,
            history: Vec::new(),
        }
    }

    /// Move the record to `next`.
    ///
    /// Fails with [`StateError::InvalidTransition`] if `next` is not reachable
    /// from the current status in one step; the record is left untouched.
    pub fn transition(&mut self, next: S) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                entity: S::ENTITY,
                id: self.id.clone(),
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }

        let now = Utc::now();
        self.history.push(StatusChange {
            previous_status: self.status,
            new_status: next,
            timestamp: now,
        });
        self.status = next;
        self.updated_at = Some(now);

        if next.is_running() && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if next.is_terminal() {
            self.end_time = Some(now);
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration between `start_time` and `end_time`, if both are set.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    pub fn set_result(&mut self, result: ContextMap) {
        self.result = Some(result);
        self.touch();
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.touch();
    }

    pub fn set_metric(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metrics.insert(key.into(), value);
        self.touch();
    }

    /// Add `by` to an integer metric, creating it at zero if absent.
    pub fn increment_metric(&mut self, key: &str, by: i64) {
        let current = self
            .metrics
            .get(key)
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);
        self.metrics
            .insert(key.to_string(), serde_json::Value::from(current + by));
        self.touch();
    }
}

// ---------------------------------------------------------------------------
// Snapshots and summaries
// ---------------------------------------------------------------------------

/// Deep copy of everything the store knows about one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow: WorkflowState,
    #[serde(default)]
    pub steps: BTreeMap<String, StepState>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentState>,
}

/// Aggregate progress view of one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStatusSummary {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub running_steps: usize,
    pub agents: BTreeMap<String, AgentStatus>,
}

impl WorkflowSnapshot {
    pub fn summary(&self) -> WorkflowStatusSummary {
        let count = |status: StepStatus| self.steps.values().filter(|s| s.status == status).count();
        WorkflowStatusSummary {
            workflow_id: self.workflow.id.clone(),
            status: self.workflow.status,
            total_steps: self.steps.len(),
            completed_steps: count(StepStatus::Completed),
            failed_steps: count(StepStatus::Failed),
            skipped_steps: count(StepStatus::Skipped),
            running_steps: count(StepStatus::Running),
            agents: self
                .agents
                .iter()
                .map(|(id, a)| (id.clone(), a.status))
                .collect(),
        }
    }
}
