//! Single step invocation: one agent call under an optional timeout.
//!
//! `run_step` is the body of every task the executor spawns. It owns
//! everything it touches (an `Arc` of the agent and a snapshot of the
//! context), so the task can be aborted at any await point.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentflow_types::error::AgentError;
use agentflow_types::workflow::ContextMap;

use crate::agent::BoxAgent;

use super::context::ContextError;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Why a step ended `Failed`. Contained to the step: siblings keep running and
/// only dependents are skipped.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The agent returned an error.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Every agent listed for the step has failed in this run, or none is listed.
    #[error("no usable agent for step '{0}'")]
    NoAgentAvailable(String),

    /// The agent call exceeded the step timeout.
    #[error("step timed out after {0:?}")]
    TimedOut(Duration),

    /// The agent call was still running when the workflow deadline passed.
    #[error("workflow timed out")]
    WorkflowTimedOut,

    /// The task running the agent panicked.
    #[error("agent task panicked: {0}")]
    Panicked(String),

    /// The task running the agent was aborted before it finished.
    #[error("agent task was aborted")]
    Aborted,

    /// The step's output could not be merged into the context.
    #[error("context merge failed: {0}")]
    Context(#[from] ContextError),
}

// ---------------------------------------------------------------------------
// StepRun
// ---------------------------------------------------------------------------

/// What a step task hands back to the executor.
#[derive(Debug)]
pub struct StepRun {
    pub outcome: Result<ContextMap, StepError>,
    pub elapsed: Duration,
}

/// Invoke `agent` on `input`, bounded by `timeout` when set.
pub async fn run_step(
    agent: Arc<BoxAgent>,
    input: ContextMap,
    timeout: Option<Duration>,
) -> StepRun {
    let started = Instant::now();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, agent.execute(&input)).await {
            Ok(result) => result.map_err(StepError::from),
            Err(_) => Err(StepError::TimedOut(limit)),
        },
        None => agent.execute(&input).await.map_err(StepError::from),
    };
    StepRun {
        outcome,
        elapsed: started.elapsed(),
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
