//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and `WorkflowDefinition`, validates structural
//! constraints, and pairs a validated definition with its `StepGraph` as a
//! ready-to-run [`Workflow`].

use std::collections::HashSet;
use std::path::Path;

use agentflow_types::workflow::WorkflowDefinition;
use thiserror::Error;

use super::dag::StepGraph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A workflow definition that cannot be run. Always raised before any step is
/// dispatched.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("duplicate step ID: '{0}'")]
    DuplicateStep(String),
}

// ---------------------------------------------------------------------------
// Validated workflow
// ---------------------------------------------------------------------------

/// A definition that passed validation, together with its dependency graph.
#[derive(Debug, Clone)]
pub struct Workflow {
    definition: WorkflowDefinition,
    graph: StepGraph,
}

impl Workflow {
    /// Validate `definition` and build its step graph.
    pub fn new(definition: WorkflowDefinition) -> Result<Self, WorkflowError> {
        validate_fields(&definition)?;
        let graph = StepGraph::new(&definition.steps)?;
        Ok(Self { definition, graph })
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, WorkflowError> {
        Self::new(parse_yaml(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn into_definition(self) -> WorkflowDefinition {
        self.definition
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def = parse_yaml(yaml)?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

fn parse_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Id and name are non-empty
/// - Concurrency >= 1 and timeouts > 0 where set
/// - Agent ids are non-empty and unique
/// - Step ids are non-empty and unique, dependencies exist, no step depends
///   on itself, and the dependency graph is acyclic
///
/// An empty step list is valid; running it completes immediately.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    validate_fields(def)?;
    StepGraph::new(&def.steps)?;
    Ok(())
}

fn validate_fields(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.id.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow id must not be empty".to_string(),
        ));
    }
    if def.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }

    if def.concurrency == Some(0) {
        return Err(WorkflowError::ValidationError(
            "concurrency must be >= 1".to_string(),
        ));
    }
    if def.timeout_secs == Some(0) {
        return Err(WorkflowError::ValidationError(
            "timeout must be > 0".to_string(),
        ));
    }

    let mut agent_ids = HashSet::new();
    for agent in &def.agents {
        if agent.id.is_empty() {
            return Err(WorkflowError::ValidationError(
                "agent id must not be empty".to_string(),
            ));
        }
        if !agent_ids.insert(agent.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate agent ID: '{}'",
                agent.id
            )));
        }
    }

    for step in &def.steps {
        if step.timeout_secs == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
