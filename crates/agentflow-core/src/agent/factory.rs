//! Agent construction from configuration.

use agentflow_types::error::AgentError;
use agentflow_types::workflow::{AgentConfig, DEFAULT_AGENT_KIND};

use super::box_agent::BoxAgent;
use super::builtin::{NoopAgent, ScriptedAgent};

/// Builds agents from their workflow configuration.
///
/// Implementations are resolved once per run, before any step is dispatched,
/// plus once for every placeholder agent materialized for an unknown id.
pub trait AgentFactory: Send + Sync {
    fn construct(&self, config: &AgentConfig) -> Result<BoxAgent, AgentError>;
}

/// Factory for the agent types that ship with the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinAgentFactory;

impl AgentFactory for BuiltinAgentFactory {
    fn construct(&self, config: &AgentConfig) -> Result<BoxAgent, AgentError> {
        match config.kind.as_str() {
            DEFAULT_AGENT_KIND | "noop" => Ok(BoxAgent::new(NoopAgent::from_config(config))),
            "scripted" => Ok(BoxAgent::new(ScriptedAgent::from_config(config)?)),
            other => Err(AgentError::UnsupportedKind {
                agent_id: config.id.clone(),
                kind: other.to_string(),
            }),
        }
    }
}
