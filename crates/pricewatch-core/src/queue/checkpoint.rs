//! Checkpoint file I/O: JSON, atomically replaced via `<path>.tmp` + rename.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::QueueState;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint at {path} is not valid json: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Serialize and atomically replace the checkpoint at `path`.
pub async fn write_checkpoint(path: &Path, state: &QueueState) -> Result<(), CheckpointError> {
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };

    let bytes = serde_json::to_vec_pretty(state).map_err(|source| CheckpointError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

/// Read the checkpoint at `path`; `Ok(None)` when there is none.
pub async fn read_checkpoint(path: &Path) -> Result<Option<QueueState>, CheckpointError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let state = serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Task;
    use crate::queue::DeadTask;

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = read_checkpoint(&dir.path().join("checkpoint.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn write_replaces_file_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("checkpoint.json");

        let mut state = QueueState::default();
        state.queue.push(Task::new("CLAAS", "1"));
        write_checkpoint(&path, &state).await.unwrap();

        state.queue.clear();
        state.dead.push(DeadTask::new(Task::new("MANITOU", "2"), "boom"));
        write_checkpoint(&path, &state).await.unwrap();

        let loaded = read_checkpoint(&path).await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let err = read_checkpoint(&path).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Json { .. }));
    }
}
