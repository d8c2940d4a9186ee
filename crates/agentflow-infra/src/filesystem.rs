//! Data directory layout for AgentFlow.

use std::path::{Path, PathBuf};

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "AGENTFLOW_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `AGENTFLOW_DATA_DIR` environment variable
/// 2. `~/.agentflow`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".agentflow");
    }

    // Last resort: current directory
    PathBuf::from(".agentflow")
}

/// Default location of a workflow's state snapshot: `{data_dir}/runs/{workflow_id}.json`.
pub fn snapshot_path(data_dir: &Path, workflow_id: &str) -> PathBuf {
    data_dir.join("runs").join(format!("{workflow_id}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_path() {
        let data_dir = PathBuf::from("/home/user/.agentflow");
        assert_eq!(
            snapshot_path(&data_dir, "research"),
            PathBuf::from("/home/user/.agentflow/runs/research.json")
        );
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var(DATA_DIR_ENV, "/tmp/test-agentflow");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-agentflow"));
        unsafe {
            std::env::remove_var(DATA_DIR_ENV);
        }
    }
}
