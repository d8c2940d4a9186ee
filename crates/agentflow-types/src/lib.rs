//! Shared domain types for AgentFlow.
//!
//! Status enums and their transition graphs, state records, workflow
//! definitions, run results, engine events, and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod status;
pub mod workflow;
