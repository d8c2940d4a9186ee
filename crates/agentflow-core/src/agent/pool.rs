//! Id-keyed set of agents available to one workflow run.

use std::collections::HashMap;
use std::sync::Arc;

use agentflow_types::error::AgentError;
use agentflow_types::workflow::AgentConfig;

use super::box_agent::BoxAgent;
use super::factory::AgentFactory;
use super::handle::Agent;

/// Agents keyed by id. Lookups are O(1) and return `None` for unknown ids.
#[derive(Debug, Default)]
pub struct AgentPool {
    agents: HashMap<String, Arc<BoxAgent>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool with one agent per config.
    pub fn from_configs(
        configs: &[AgentConfig],
        factory: &impl AgentFactory,
    ) -> Result<Self, AgentError> {
        let mut pool = Self::new();
        pool.construct_missing(configs, factory)?;
        Ok(pool)
    }

    /// Construct every configured agent whose id is not already pooled.
    /// Agents placed in the pool by the caller take precedence over configs.
    pub fn construct_missing(
        &mut self,
        configs: &[AgentConfig],
        factory: &impl AgentFactory,
    ) -> Result<(), AgentError> {
        for config in configs {
            if !self.agents.contains_key(&config.id) {
                let agent = factory.construct(config)?;
                self.agents.insert(config.id.clone(), Arc::new(agent));
            }
        }
        Ok(())
    }

    /// Add an agent under its own id, replacing any previous one.
    pub fn insert<A: Agent + 'static>(&mut self, agent: A) {
        self.insert_boxed(BoxAgent::new(agent));
    }

    pub fn insert_boxed(&mut self, agent: BoxAgent) {
        self.agents.insert(agent.id().to_string(), Arc::new(agent));
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<BoxAgent>> {
        self.agents.get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Return the agent for `agent_id`, constructing a default-kind
    /// placeholder through `factory` if the id is unknown.
    ///
    /// The placeholder makes a misspelt agent id run as a no-op instead of
    /// failing, so every materialization is logged at warn level.
    pub fn resolve_or_materialize(
        &mut self,
        agent_id: &str,
        factory: &impl AgentFactory,
    ) -> Result<Arc<BoxAgent>, AgentError> {
        if let Some(agent) = self.get(agent_id) {
            return Ok(agent);
        }
        tracing::warn!(
            agent_id,
            "agent id not configured, materializing a default placeholder agent"
        );
        let agent = Arc::new(factory.construct(&AgentConfig::placeholder(agent_id))?);
        self.agents.insert(agent_id.to_string(), Arc::clone(&agent));
        Ok(agent)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Sorted agent ids.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
