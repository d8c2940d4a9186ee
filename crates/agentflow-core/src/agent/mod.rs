//! Agent façade: the capability trait, its type-erased wrapper, the
//! construction factory, built-in agents, and the per-run agent pool.

pub mod box_agent;
pub mod builtin;
pub mod factory;
pub mod handle;
pub mod pool;

pub use box_agent::BoxAgent;
pub use factory::{AgentFactory, BuiltinAgentFactory};
pub use handle::Agent;
pub use pool::AgentPool;
