use thiserror::Error;

/// Errors raised by the workflow state store and by individual state records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("workflow '{0}' is already registered and still active")]
    DuplicateWorkflow(String),

    #[error("workflow '{0}' not found")]
    UnknownWorkflow(String),

    #[error("step '{step_id}' not found in workflow '{workflow_id}'")]
    UnknownStep {
        workflow_id: String,
        step_id: String,
    },

    #[error("agent '{agent_id}' not found in workflow '{workflow_id}'")]
    UnknownAgent {
        workflow_id: String,
        agent_id: String,
    },

    #[error("invalid {entity} transition for '{id}': {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("workflow '{0}' has finished and no longer accepts writes")]
    WorkflowSealed(String),
}

/// Errors raised while constructing or invoking an agent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("agent '{agent_id}' failed: {message}")]
    Failed { agent_id: String, message: String },

    #[error("unsupported agent type '{kind}' for agent '{agent_id}'")]
    UnsupportedKind { agent_id: String, kind: String },

    #[error("invalid configuration for agent '{agent_id}': {message}")]
    InvalidConfig { agent_id: String, message: String },
}

impl AgentError {
    pub fn failed(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        AgentError::Failed {
            agent_id: agent_id.into(),
            message: message.into(),
        }
    }
}
