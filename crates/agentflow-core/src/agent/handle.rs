//! The `Agent` capability every step executor implements.
//!
//! The engine knows nothing about what an agent does internally: it hands
//! over a snapshot of the workflow context and receives a mapping back.

use std::future::Future;

use agentflow_types::error::AgentError;
use agentflow_types::workflow::ContextMap;

/// An autonomous unit that turns the current workflow context into a result.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). Wrap an
/// implementation in [`BoxAgent`](super::box_agent::BoxAgent) to store it in
/// an [`AgentPool`](super::pool::AgentPool).
///
/// Cancellation contract: the engine cancels a call by dropping its future.
/// Implementations must leave no partial external effect that depends on the
/// future running to completion past an `.await` point.
pub trait Agent: Send + Sync {
    /// Id the agent is registered under in a workflow.
    fn id(&self) -> &str;

    /// Human-readable name; defaults to the id.
    fn name(&self) -> &str {
        self.id()
    }

    /// Run the agent against `input` and return its output mapping.
    fn execute(
        &self,
        input: &ContextMap,
    ) -> impl Future<Output = Result<ContextMap, AgentError>> + Send;
}
