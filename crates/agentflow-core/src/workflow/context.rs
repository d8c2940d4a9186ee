//! Shared workflow context with per-step output tracking.
//!
//! `WorkflowContext` is the mapping threaded through a workflow run. It is
//! seeded by the caller's input and every completed step's output is merged
//! into it. Only the engine task mutates it; agents receive a snapshot.
//!
//! Collision policy: when two steps write the same key, the step whose output
//! is merged later wins. Merges happen one at a time in completion order, and
//! that order is recorded so the outcome is reproducible from a `RunResult`.

use std::collections::BTreeMap;

use agentflow_types::workflow::ContextMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("total context size ({total} bytes) would exceed maximum ({max} bytes)")]
    TooLarge { total: usize, max: usize },

    #[error("failed to serialize context value: {0}")]
    Serialization(String),

    #[error("failed to restore context: {0}")]
    Restore(String),
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Mutable data mapping for one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    workflow_id: String,
    run_id: Uuid,
    data: ContextMap,
    step_outputs: BTreeMap<String, ContextMap>,
    completion_order: Vec<String>,
}

impl WorkflowContext {
    pub fn new(workflow_id: impl Into<String>, run_id: Uuid, initial: ContextMap) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
            data: initial,
            step_outputs: BTreeMap::new(),
            completion_order: Vec::new(),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn data(&self) -> &ContextMap {
        &self.data
    }

    /// Owned copy of the current data, handed to an agent call.
    pub fn snapshot(&self) -> ContextMap {
        self.data.clone()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Output a step produced, as merged (after any truncation).
    pub fn step_output(&self, step_id: &str) -> Option<&ContextMap> {
        self.step_outputs.get(step_id)
    }

    /// Step ids in the order their outputs were merged.
    pub fn completion_order(&self) -> &[String] {
        &self.completion_order
    }

    /// Merge a completed step's output into the context.
    ///
    /// Keys already present are overwritten. Returns the keys whose previous
    /// value was replaced by a different one. An output larger than
    /// `MAX_STEP_OUTPUT_SIZE` is replaced by a truncation marker; a merge that
    /// would push the context past `MAX_CONTEXT_SIZE` is rejected and leaves
    /// the context unchanged.
    pub fn merge_step_output(
        &mut self,
        step_id: &str,
        output: ContextMap,
    ) -> Result<Vec<String>, ContextError> {
        let size = serialized_len(&output)?;
        let output = if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            truncation_marker(size)
        } else {
            output
        };

        let mut merged = self.data.clone();
        let mut collisions = Vec::new();
        for (key, value) in &output {
            if let Some(previous) = merged.insert(key.clone(), value.clone()) {
                if &previous != value {
                    collisions.push(key.clone());
                }
            }
        }

        // Overwritten keys count once, at their new size.
        let projected = serialized_len(&merged)?;
        if projected > MAX_CONTEXT_SIZE {
            return Err(ContextError::TooLarge {
                total: projected,
                max: MAX_CONTEXT_SIZE,
            });
        }

        if !collisions.is_empty() {
            tracing::debug!(step_id, ?collisions, "step output overwrote context keys");
        }

        self.data = merged;
        self.step_outputs.insert(step_id.to_string(), output);
        self.completion_order.push(step_id.to_string());
        Ok(collisions)
    }

    /// Serialized size of the merged data in bytes.
    pub fn total_size(&self) -> usize {
        serde_json::to_string(&self.data).map(|s| s.len()).unwrap_or(0)
    }

    pub fn into_data(self) -> ContextMap {
        self.data
    }

    /// Serialize the entire context to JSON.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({}))
    }

    /// Restore a context from `to_json` output.
    pub fn from_json(value: Value) -> Result<Self, ContextError> {
        serde_json::from_value(value).map_err(|e| ContextError::Restore(e.to_string()))
    }
}

fn serialized_len(map: &ContextMap) -> Result<usize, ContextError> {
    serde_json::to_string(map)
        .map(|s| s.len())
        .map_err(|e| ContextError::Serialization(e.to_string()))
}

fn truncation_marker(original_size: usize) -> ContextMap {
    let mut marker = ContextMap::new();
    marker.insert("_truncated".into(), json!(true));
    marker.insert("_original_size".into(), json!(original_size));
    marker.insert(
        "_message".into(),
        json!(format!(
            "output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"
        )),
    );
    marker
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
