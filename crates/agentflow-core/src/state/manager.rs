//! In-memory lifecycle store for workflows, steps, and agents.
//!
//! `WorkflowStateManager` is constructed explicitly and shared by `Arc`; one
//! instance may serve a single run or many runs, at the caller's choice.
//!
//! Each workflow lives behind its own `Mutex`, reached through a `DashMap`
//! keyed by workflow id. Read-modify-write operations on one workflow are
//! serialized; operations on distinct workflows never contend. The `DashMap`
//! shard guard is released before the per-workflow lock is taken, and no lock
//! is ever held across an `.await`.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use agentflow_types::error::StateError;
use agentflow_types::state::{
    AgentState, StepState, WorkflowSnapshot, WorkflowState, WorkflowStatusSummary,
};
use agentflow_types::status::{AgentStatus, StepStatus, WorkflowStatus};
use agentflow_types::workflow::ContextMap;

type SharedEntry = Arc<Mutex<WorkflowSnapshot>>;

/// Concurrent store of workflow, step, and agent state records.
///
/// Once a workflow reaches a terminal status it is sealed: reads keep working,
/// every write fails with [`StateError::WorkflowSealed`].
///
/// Updates addressed to an unknown workflow, step, or agent fail with the
/// matching `Unknown*` error rather than being ignored.
#[derive(Debug, Default)]
pub struct WorkflowStateManager {
    workflows: DashMap<String, SharedEntry>,
}

impl WorkflowStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the store to an empty state.
    pub fn initialize(&self) {
        self.workflows.clear();
    }

    /// Drop every tracked workflow.
    pub fn cleanup(&self) {
        let dropped = self.workflows.len();
        self.workflows.clear();
        tracing::debug!(dropped, "state store cleaned up");
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a workflow in `Pending` with no steps or agents.
    ///
    /// A previous workflow with the same id is replaced if it is terminal;
    /// if it is still active the call fails with `DuplicateWorkflow`.
    pub fn initialize_workflow(&self, workflow_id: &str, name: &str) -> Result<(), StateError> {
        let fresh = WorkflowSnapshot {
            workflow: WorkflowState::new(workflow_id, name),
            steps: Default::default(),
            agents: Default::default(),
        };

        self.insert_unless_active(workflow_id, fresh)?;
        tracing::debug!(workflow_id, "workflow state initialized");
        Ok(())
    }

    /// Register a step in `Pending`, replacing any earlier record with the same id.
    pub fn initialize_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        name: &str,
    ) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            snap.steps
                .insert(step_id.to_string(), StepState::new(step_id, name));
            Ok(())
        })
    }

    /// Register an agent in `Initialized`, replacing any earlier record with the same id.
    pub fn initialize_agent(
        &self,
        workflow_id: &str,
        agent_id: &str,
        name: &str,
    ) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            snap.agents
                .insert(agent_id.to_string(), AgentState::new(agent_id, name));
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    pub fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> Result<(), StateError> {
        self.write(workflow_id, |snap| snap.workflow.transition(status))?;
        tracing::debug!(workflow_id, status = %status, "workflow status updated");
        Ok(())
    }

    pub fn update_step_status(
        &self,
        workflow_id: &str,
        step_id: &str,
        status: StepStatus,
    ) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            step_mut(snap, step_id)?.transition(status)
        })?;
        tracing::debug!(workflow_id, step_id, status = %status, "step status updated");
        Ok(())
    }

    pub fn update_agent_status(
        &self,
        workflow_id: &str,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            agent_mut(snap, agent_id)?.transition(status)
        })?;
        tracing::debug!(workflow_id, agent_id, status = %status, "agent status updated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Results, errors, metrics
    // -----------------------------------------------------------------------

    pub fn set_workflow_result(&self, workflow_id: &str, result: ContextMap) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            snap.workflow.set_result(result);
            Ok(())
        })
    }

    pub fn set_workflow_error(&self, workflow_id: &str, error: &str) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            snap.workflow.set_error(error);
            Ok(())
        })
    }

    pub fn set_workflow_metric(
        &self,
        workflow_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            snap.workflow.set_metric(key, value);
            Ok(())
        })
    }

    pub fn set_step_result(
        &self,
        workflow_id: &str,
        step_id: &str,
        result: ContextMap,
    ) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            step_mut(snap, step_id)?.set_result(result);
            Ok(())
        })
    }

    pub fn set_step_error(&self, workflow_id: &str, step_id: &str, error: &str) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            step_mut(snap, step_id)?.set_error(error);
            Ok(())
        })
    }

    pub fn set_step_metric(
        &self,
        workflow_id: &str,
        step_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            step_mut(snap, step_id)?.set_metric(key, value);
            Ok(())
        })
    }

    pub fn set_agent_result(
        &self,
        workflow_id: &str,
        agent_id: &str,
        result: ContextMap,
    ) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            agent_mut(snap, agent_id)?.set_result(result);
            Ok(())
        })
    }

    pub fn set_agent_error(&self, workflow_id: &str, agent_id: &str, error: &str) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            agent_mut(snap, agent_id)?.set_error(error);
            Ok(())
        })
    }

    pub fn increment_agent_metric(
        &self,
        workflow_id: &str,
        agent_id: &str,
        key: &str,
        by: i64,
    ) -> Result<(), StateError> {
        self.write(workflow_id, |snap| {
            agent_mut(snap, agent_id)?.increment_metric(key, by);
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn contains(&self, workflow_id: &str) -> bool {
        self.workflows.contains_key(workflow_id)
    }

    pub fn workflow_state(&self, workflow_id: &str) -> Result<WorkflowState, StateError> {
        self.read(workflow_id, |snap| snap.workflow.clone())
    }

    pub fn step_state(&self, workflow_id: &str, step_id: &str) -> Result<StepState, StateError> {
        self.read(workflow_id, |snap| snap.steps.get(step_id).cloned())?
            .ok_or_else(|| StateError::UnknownStep {
                workflow_id: workflow_id.to_string(),
                step_id: step_id.to_string(),
            })
    }

    pub fn agent_state(&self, workflow_id: &str, agent_id: &str) -> Result<AgentState, StateError> {
        self.read(workflow_id, |snap| snap.agents.get(agent_id).cloned())?
            .ok_or_else(|| StateError::UnknownAgent {
                workflow_id: workflow_id.to_string(),
                agent_id: agent_id.to_string(),
            })
    }

    /// Deep copy of the workflow and all of its step and agent records.
    pub fn snapshot(&self, workflow_id: &str) -> Result<WorkflowSnapshot, StateError> {
        self.read(workflow_id, WorkflowSnapshot::clone)
    }

    /// Aggregate progress counts. Pure read: repeated calls without an
    /// intervening write return identical values.
    pub fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatusSummary, StateError> {
        self.read(workflow_id, WorkflowSnapshot::summary)
    }

    /// Ids of every tracked workflow, sorted.
    pub fn list_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Forget a workflow, returning its final snapshot.
    pub fn remove_workflow(&self, workflow_id: &str) -> Result<WorkflowSnapshot, StateError> {
        let (_, entry) = self
            .workflows
            .remove(workflow_id)
            .ok_or_else(|| StateError::UnknownWorkflow(workflow_id.to_string()))?;
        let snapshot = entry.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(snapshot)
    }

    /// Re-insert a previously exported snapshot.
    ///
    /// Same replacement rule as `initialize_workflow`: a finished record is
    /// overwritten, an active one is left alone and `DuplicateWorkflow` is
    /// returned.
    pub fn restore(&self, snapshot: WorkflowSnapshot) -> Result<(), StateError> {
        let id = snapshot.workflow.id.clone();
        self.insert_unless_active(&id, snapshot)?;
        tracing::debug!(workflow_id = id, "workflow state restored");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn insert_unless_active(
        &self,
        workflow_id: &str,
        record: WorkflowSnapshot,
    ) -> Result<(), StateError> {
        match self.workflows.entry(workflow_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let active = {
                    let guard = occupied.get().lock().unwrap_or_else(PoisonError::into_inner);
                    !guard.workflow.is_terminal()
                };
                if active {
                    return Err(StateError::DuplicateWorkflow(workflow_id.to_string()));
                }
                occupied.insert(Arc::new(Mutex::new(record)));
                tracing::debug!(workflow_id, "replaced finished workflow state");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(record)));
            }
        }
        Ok(())
    }

    fn entry(&self, workflow_id: &str) -> Result<SharedEntry, StateError> {
        self.workflows
            .get(workflow_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| StateError::UnknownWorkflow(workflow_id.to_string()))
    }

    fn read<R>(
        &self,
        workflow_id: &str,
        f: impl FnOnce(&WorkflowSnapshot) -> R,
    ) -> Result<R, StateError> {
        let entry = self.entry(workflow_id)?;
        let guard = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&guard))
    }

    fn write<R>(
        &self,
        workflow_id: &str,
        f: impl FnOnce(&mut WorkflowSnapshot) -> Result<R, StateError>,
    ) -> Result<R, StateError> {
        let entry = self.entry(workflow_id)?;
        let mut guard = entry.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.workflow.is_terminal() {
            return Err(StateError::WorkflowSealed(workflow_id.to_string()));
        }
        f(&mut guard)
    }
}

fn step_mut<'a>(snap: &'a mut WorkflowSnapshot, step_id: &str) -> Result<&'a mut StepState, StateError> {
    let workflow_id = &snap.workflow.id;
    snap.steps.get_mut(step_id).ok_or_else(|| StateError::UnknownStep {
        workflow_id: workflow_id.clone(),
        step_id: step_id.to_string(),
    })
}

fn agent_mut<'a>(snap: &'a mut WorkflowSnapshot, agent_id: &str) -> Result<&'a mut AgentState, StateError> {
    let workflow_id = &snap.workflow.id;
    snap.agents.get_mut(agent_id).ok_or_else(|| StateError::UnknownAgent {
        workflow_id: workflow_id.clone(),
        agent_id: agent_id.to_string(),
    })
}
