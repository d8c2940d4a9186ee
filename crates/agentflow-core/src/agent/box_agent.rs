//! BoxAgent -- object-safe dynamic dispatch wrapper for Agent.
//!
//! 1. `AgentDyn` is an object-safe mirror of `Agent` with a boxed future
//! 2. Every `T: Agent` gets `AgentDyn` through a blanket impl
//! 3. `BoxAgent` wraps `Box<dyn AgentDyn>` and delegates

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use agentflow_types::error::AgentError;
use agentflow_types::workflow::ContextMap;

use super::handle::Agent;

/// Object-safe version of [`Agent`] with a boxed future.
pub trait AgentDyn: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        input: &'a ContextMap,
    ) -> Pin<Box<dyn Future<Output = Result<ContextMap, AgentError>> + Send + 'a>>;
}

impl<T: Agent> AgentDyn for T {
    fn id(&self) -> &str {
        Agent::id(self)
    }

    fn name(&self) -> &str {
        Agent::name(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        input: &'a ContextMap,
    ) -> Pin<Box<dyn Future<Output = Result<ContextMap, AgentError>> + Send + 'a>> {
        Box::pin(self.execute(input))
    }
}

/// Type-erased agent, so agents of different concrete types can share a pool.
pub struct BoxAgent {
    inner: Box<dyn AgentDyn + Send + Sync>,
}

impl BoxAgent {
    pub fn new<T: Agent + 'static>(agent: T) -> Self {
        Self {
            inner: Box::new(agent),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute(&self, input: &ContextMap) -> Result<ContextMap, AgentError> {
        self.inner.execute_boxed(input).await
    }
}

impl fmt::Debug for BoxAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxAgent")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}
