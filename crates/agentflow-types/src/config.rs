//! Engine configuration types for AgentFlow.
//!
//! `EngineConfig` is the top level of `config.toml`. Every
//! field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Execution engine settings shared by all runs of one executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrency limit used when a workflow does not declare one.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Whole-run deadline used when a workflow does not declare one.
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,

    /// Agent call timeout used when a step does not declare one.
    /// `None` lets a call run until the workflow deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,

    /// On cancellation, abort in-flight agent calls instead of letting them
    /// finish.
    #[serde(default)]
    pub abort_in_flight_on_cancel: bool,

    /// Capacity of the workflow event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            workflow_timeout_secs: default_workflow_timeout_secs(),
            step_timeout_secs: None,
            abort_in_flight_on_cancel: false,
            event_capacity: default_event_capacity(),
        }
    }
}
