//! Per-run step status bookkeeping for the scheduler.
//!
//! The executor mirrors every step status it writes to the state store into a
//! `RunLedger`, so scheduling decisions never read back from the store.

use std::collections::HashMap;

use agentflow_types::status::{Lifecycle, StepStatus};

use super::dag::StepGraph;

#[derive(Debug)]
pub struct RunLedger<'g> {
    graph: &'g StepGraph,
    statuses: HashMap<String, StepStatus>,
}

impl<'g> RunLedger<'g> {
    /// Every step of `graph` starts `Pending`.
    pub fn new(graph: &'g StepGraph) -> Self {
        let statuses = graph
            .step_ids()
            .map(|id| (id.to_string(), StepStatus::Pending))
            .collect();
        Self { graph, statuses }
    }

    pub fn status(&self, step_id: &str) -> StepStatus {
        self.statuses
            .get(step_id)
            .copied()
            .unwrap_or(StepStatus::Pending)
    }

    pub fn set(&mut self, step_id: &str, status: StepStatus) {
        self.statuses.insert(step_id.to_string(), status);
    }

    /// Pending steps whose dependencies have all completed, in declaration order.
    pub fn eligible(&self) -> Vec<String> {
        self.graph
            .eligible(&self.statuses)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Mark every pending step downstream of a failed or skipped step as
    /// skipped, repeating until nothing changes. Returns `(step, cause)` pairs
    /// in the order they were marked; `cause` is the dependency that blocked
    /// the step.
    pub fn propagate_skips(&mut self) -> Vec<(String, String)> {
        let mut skipped = Vec::new();
        loop {
            let blocked: Vec<(String, String)> = self
                .graph
                .blocked(&self.statuses)
                .into_iter()
                .map(|(step, cause)| (step.to_string(), cause.to_string()))
                .collect();
            if blocked.is_empty() {
                return skipped;
            }
            for (step, cause) in blocked {
                self.statuses.insert(step.clone(), StepStatus::Skipped);
                skipped.push((step, cause));
            }
        }
    }

    /// Steps with the given status, in declaration order.
    pub fn with_status(&self, status: StepStatus) -> Vec<String> {
        self.graph
            .step_ids()
            .filter(|id| self.status(id) == status)
            .map(str::to_string)
            .collect()
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }

    /// Whether every step has reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.statuses.values().all(|s| s.is_terminal())
    }

    pub fn any_failed(&self) -> bool {
        self.count(StepStatus::Failed) > 0
    }

    /// Non-terminal steps that can never make progress.
    ///
    /// Returns `Some` when nothing is in flight, some step is not terminal,
    /// and no step is eligible. With a validated graph this indicates
    /// inconsistent bookkeeping.
    pub fn deadlocked(&self, in_flight: usize) -> Option<Vec<String>> {
        if in_flight > 0 || self.is_complete() || !self.eligible().is_empty() {
            return None;
        }
        Some(
            self.graph
                .step_ids()
                .filter(|id| !self.status(id).is_terminal())
                .map(str::to_string)
                .collect(),
        )
    }
}
