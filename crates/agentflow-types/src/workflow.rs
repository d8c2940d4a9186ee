//! Workflow definition and run result types.
//!
//! `WorkflowDefinition` is the canonical shape of a workflow: YAML files and
//! programmatic construction both produce it. `RunResult` is what one
//! execution attempt hands back to the caller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{StepStatus, WorkflowStatus};

/// Mapping threaded through a run and exchanged with agents.
pub type ContextMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A workflow: agents plus a dependency graph of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier, also the key in the state store.
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Maximum simultaneous agent calls for one run (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Whole-run deadline in seconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Agents available to the steps of this workflow.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// Steps in declaration order.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            concurrency: None,
            timeout_secs: None,
            agents: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// A unit of work bound to a primary agent, with declared dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow.
    pub id: String,
    /// Display name; the id is used when empty.
    #[serde(default)]
    pub name: String,
    /// Informational step kind (e.g. "research", "analysis").
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    #[serde(default = "default_io_type")]
    pub input_type: String,
    #[serde(default = "default_io_type")]
    pub output_type: String,
    /// Agent ids. The first is primary; later ids are fallbacks used when an
    /// earlier agent has failed in this run.
    #[serde(default, alias = "agent_ids")]
    pub agents: Vec<String>,
    /// Step ids that must complete before this step becomes eligible.
    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<String>,
    /// Agent call timeout for this step (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_io_type() -> String {
    "dict".to_string()
}

impl StepDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            step_type: None,
            input_type: default_io_type(),
            output_type: default_io_type(),
            agents: Vec::new(),
            dependencies: Vec::new(),
            timeout_secs: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agents.push(agent_id.into());
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// Construction parameters for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Agent kind understood by the agent factory.
    #[serde(rename = "type", default = "default_agent_kind")]
    pub kind: String,
    /// Kind-specific parameters.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: ContextMap,
}

/// Kind used for agents that only exist to satisfy an unknown id.
pub const DEFAULT_AGENT_KIND: &str = "default";

fn default_agent_kind() -> String {
    DEFAULT_AGENT_KIND.to_string()
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            kind: kind.into(),
            params: ContextMap::new(),
        }
    }

    /// Config of the placeholder agent materialized for an unknown id.
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self::new(id, DEFAULT_AGENT_KIND)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

// ---------------------------------------------------------------------------
// Run result
// ---------------------------------------------------------------------------

/// Final state of one step in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: StepStatus,
    /// Agent that executed the step, if it was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ContextMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one execution attempt of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub workflow_id: String,
    /// UUIDv7 identifying this attempt.
    pub run_id: Uuid,
    pub status: WorkflowStatus,
    /// One entry per declared step.
    pub steps: BTreeMap<String, StepOutcome>,
    /// Final merged context.
    pub context: ContextMap,
    /// Step ids in the order their outputs were merged into the context.
    pub completion_order: Vec<String>,
    /// Run-level failure (deadline exceeded) not attributable to one step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// Step ids whose final status is `status`, in id order.
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, o)| o.status == status)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RESEARCH_YAML: &str = r#"
id: research
name: Research pipeline
concurrency: 2
agents:
  - id: searcher
    type: scripted
    params:
      output:
        hits: 3
  - id: writer
steps:
  - id: search
    name: Search the web
    type: research
    agents: [searcher]
  - id: summarize
    agent_ids: [writer, searcher]
    depends_on: [search]
    timeout_secs: 30
"#;

    #[test]
    fn yaml_parses_with_defaults_and_aliases() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(RESEARCH_YAML).unwrap();
        assert_eq!(def.id, "research");
        assert_eq!(def.concurrency, Some(2));
        assert_eq!(def.timeout_secs, None);

        assert_eq!(def.agents[0].kind, "scripted");
        assert_eq!(def.agents[0].params["output"], json!({"hits": 3}));
        assert_eq!(def.agents[1].kind, DEFAULT_AGENT_KIND);
        assert_eq!(def.agents[1].display_name(), "writer");

        let search = &def.steps[0];
        assert_eq!(search.step_type.as_deref(), Some("research"));
        assert_eq!(search.input_type, "dict");
        assert_eq!(search.display_name(), "Search the web");

        let summarize = &def.steps[1];
        assert_eq!(summarize.agents, vec!["writer", "searcher"]);
        assert_eq!(summarize.dependencies, vec!["search"]);
        assert_eq!(summarize.timeout_secs, Some(30));
        assert_eq!(summarize.display_name(), "summarize");
    }

    #[test]
    fn builder_matches_yaml_shape() {
        let def = WorkflowDefinition::new("wf", "Flow")
            .with_concurrency(3)
            .with_agent(AgentConfig::new("a", "scripted").with_param("delay_ms", json!(5)))
            .with_step(StepDefinition::new("one").with_agent("a"))
            .with_step(StepDefinition::new("two").with_agent("a").depends_on("one"));

        let yaml = serde_yaml_ng::to_string(&def).unwrap();
        let back: WorkflowDefinition = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(back, def);
    }

    #[test]
    fn steps_with_status_filters() {
        let outcome = |status| StepOutcome {
            status,
            agent_id: None,
            result: None,
            error: None,
        };
        let result = RunResult {
            workflow_id: "wf".into(),
            run_id: Uuid::now_v7(),
            status: WorkflowStatus::Failed,
            steps: [
                ("a".to_string(), outcome(StepStatus::Failed)),
                ("b".to_string(), outcome(StepStatus::Skipped)),
                ("c".to_string(), outcome(StepStatus::Completed)),
            ]
            .into(),
            context: ContextMap::new(),
            completion_order: vec!["c".into()],
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        assert_eq!(result.steps_with_status(StepStatus::Skipped), vec!["b"]);
        assert_eq!(result.steps_with_status(StepStatus::Completed), vec!["c"]);
    }
}
