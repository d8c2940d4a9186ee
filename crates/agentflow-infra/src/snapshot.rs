//! JSON snapshots of workflow state.
//!
//! A snapshot is the flat, serde-encoded form of a [`WorkflowSnapshot`]:
//! RFC 3339 timestamps and canonical status strings, one record per workflow,
//! step, and agent. Snapshots are written after a run and can be loaded back
//! into a [`WorkflowStateManager`] for inspection.

use std::path::Path;

use agentflow_core::state::WorkflowStateManager;
use agentflow_types::error::StateError;
use agentflow_types::state::WorkflowSnapshot;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed snapshot {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Write `snapshot` to `path` as pretty JSON, creating parent directories.
pub async fn write_snapshot(path: &Path, snapshot: &WorkflowSnapshot) -> Result<(), SnapshotError> {
    let io_err = |source: std::io::Error| SnapshotError::Io {
        path: path.display().to_string(),
        source,
    };

    let json = serde_json::to_string_pretty(snapshot).map_err(|source| SnapshotError::Json {
        path: path.display().to_string(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::write(path, json).await.map_err(io_err)?;

    tracing::debug!(
        workflow_id = snapshot.workflow.id.as_str(),
        path = %path.display(),
        "workflow snapshot written"
    );
    Ok(())
}

/// Read a snapshot previously written by [`write_snapshot`].
pub async fn read_snapshot(path: &Path) -> Result<WorkflowSnapshot, SnapshotError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SnapshotError::Io {
            path: path.display().to_string(),
            source,
        })?;
    serde_json::from_str(&content).map_err(|source| SnapshotError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Snapshot `workflow_id` from the store and write it to `path`.
pub async fn export_workflow(
    store: &WorkflowStateManager,
    workflow_id: &str,
    path: &Path,
) -> Result<WorkflowSnapshot, SnapshotError> {
    let snapshot = store.snapshot(workflow_id)?;
    write_snapshot(path, &snapshot).await?;
    Ok(snapshot)
}

/// Load a snapshot from `path` into the store and return its workflow id.
///
/// A finished record with the same id is replaced; an active one is kept and
/// the import fails with `StateError::DuplicateWorkflow`.
pub async fn import_workflow(
    store: &WorkflowStateManager,
    path: &Path,
) -> Result<String, SnapshotError> {
    let snapshot = read_snapshot(path).await?;
    let workflow_id = snapshot.workflow.id.clone();
    store.restore(snapshot)?;
    tracing::debug!(workflow_id, path = %path.display(), "workflow snapshot restored");
    Ok(workflow_id)
}
