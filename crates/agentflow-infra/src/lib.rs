//! Infrastructure layer for AgentFlow.
//!
//! Filesystem-facing pieces the engine itself stays free of: the
//! `config.toml` loader, data directory resolution, and JSON snapshots of
//! workflow state.

pub mod config;
pub mod filesystem;
pub mod snapshot;
