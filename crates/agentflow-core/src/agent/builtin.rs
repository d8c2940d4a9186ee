//! Agents that ship with the engine.
//!
//! - [`NoopAgent`] (`type: default`) returns an empty mapping. It is also what
//!   the engine materializes for an agent id nobody configured.
//! - [`ScriptedAgent`] (`type: scripted`) returns a fixed mapping after an
//!   optional delay, or fails with a fixed message. Useful for dry runs and
//!   for exercising workflows without real agent backends.

use std::time::Duration;

use agentflow_types::error::AgentError;
use agentflow_types::workflow::{AgentConfig, ContextMap};
use serde_json::Value;

use super::handle::Agent;

// ---------------------------------------------------------------------------
// NoopAgent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NoopAgent {
    id: String,
    name: String,
}

impl NoopAgent {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.display_name().to_string(),
        }
    }
}

impl Agent for NoopAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _input: &ContextMap) -> Result<ContextMap, AgentError> {
        Ok(ContextMap::new())
    }
}

// ---------------------------------------------------------------------------
// ScriptedAgent
// ---------------------------------------------------------------------------

/// Agent whose behaviour is fully described by its config params:
///
/// ```yaml
/// - id: searcher
///   type: scripted
///   params:
///     output: { hits: 3 }   # mapping to return
///     delay_ms: 250         # optional sleep before returning
///     error: "rate limited" # optional; fail instead of returning output
/// ```
#[derive(Debug, Clone)]
pub struct ScriptedAgent {
    id: String,
    name: String,
    output: ContextMap,
    delay: Option<Duration>,
    error: Option<String>,
}

impl ScriptedAgent {
    pub fn new(id: impl Into<String>, output: ContextMap) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            output,
            delay: None,
            error: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        let invalid = |message: &str| AgentError::InvalidConfig {
            agent_id: config.id.clone(),
            message: message.to_string(),
        };

        let output = match config.params.get("output") {
            None | Some(Value::Null) => ContextMap::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(invalid("'output' must be a mapping")),
        };
        let delay = match config.params.get("delay_ms") {
            None => None,
            Some(v) => Some(Duration::from_millis(
                v.as_u64()
                    .ok_or_else(|| invalid("'delay_ms' must be a non-negative integer"))?,
            )),
        };
        let error = match config.params.get("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(invalid("'error' must be a string")),
        };

        Ok(Self {
            id: config.id.clone(),
            name: config.display_name().to_string(),
            output,
            delay,
            error,
        })
    }
}

impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _input: &ContextMap) -> Result<ContextMap, AgentError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.error {
            Some(message) => Err(AgentError::failed(&self.id, message.as_str())),
            None => Ok(self.output.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn noop_returns_empty_mapping() {
        let agent = NoopAgent::new("placeholder");
        let out = agent.execute(&ContextMap::new()).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(agent.name(), "placeholder");
    }

    #[tokio::test]
    async fn scripted_from_config_returns_output() {
        let config = AgentConfig::new("searcher", "scripted")
            .with_param("output", json!({"hits": 3}))
            .with_param("delay_ms", json!(1));
        let agent = ScriptedAgent::from_config(&config).unwrap();

        let out = agent.execute(&ContextMap::new()).await.unwrap();
        assert_eq!(out["hits"], json!(3));
    }

    #[tokio::test]
    async fn scripted_error_param_fails_call() {
        let config = AgentConfig::new("searcher", "scripted").with_param("error", json!("boom"));
        let agent = ScriptedAgent::from_config(&config).unwrap();

        let err = agent.execute(&ContextMap::new()).await.unwrap_err();
        assert_eq!(err, AgentError::failed("searcher", "boom"));
    }

    #[test]
    fn scripted_rejects_malformed_params() {
        let bad_output = AgentConfig::new("a", "scripted").with_param("output", json!([1, 2]));
        assert!(matches!(
            ScriptedAgent::from_config(&bad_output),
            Err(AgentError::InvalidConfig { .. })
        ));

        let bad_delay = AgentConfig::new("a", "scripted").with_param("delay_ms", json!(-5));
        assert!(ScriptedAgent::from_config(&bad_delay).is_err());
    }
}
