//! Engine logic for AgentFlow: state store, step graph, agents, and execution.
//!
//! Depends only on `agentflow-types`. Filesystem configuration and snapshot
//! persistence live in `agentflow-infra`.

pub mod agent;
pub mod event;
pub mod state;
pub mod workflow;
