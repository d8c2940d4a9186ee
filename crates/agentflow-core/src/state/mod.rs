//! Workflow, step, and agent lifecycle state.

pub mod manager;

pub use manager::WorkflowStateManager;
