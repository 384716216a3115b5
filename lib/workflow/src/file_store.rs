//! File-backed workflow persistence.
//!
//! One `<workflow id>.json` file per instance in a state directory. Writes
//! go to a temporary sibling first, are synced to disk, and are renamed into
//! place; the directory is then synced so the rename itself survives a power
//! loss. A reader never observes a half-written snapshot. The version check
//! and the rename happen under one lock; a single store instance per
//! directory is assumed.

use crate::envelope::{decode_snapshot, encode_snapshot};
use crate::error::PersistenceError;
use crate::persistence::{StatePersistence, check_version};
use crate::state::WorkflowState;
use async_trait::async_trait;
use stagehand_core::WorkflowId;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

const SNAPSHOT_EXTENSION: &str = "json";

/// Snapshot store rooted at a directory.
#[derive(Debug)]
pub struct FileStatePersistence {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStatePersistence {
    /// Opens (and creates, if needed) the state directory.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| unavailable(&dir, "create state directory", &e))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// The directory snapshots are stored in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, id: WorkflowId) -> PathBuf {
        self.dir.join(format!("{id}.{SNAPSHOT_EXTENSION}"))
    }

    async fn read_snapshot(&self, id: WorkflowId) -> Result<Option<WorkflowState>, PersistenceError> {
        let path = self.snapshot_path(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => decode_snapshot(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(&path, "read snapshot", &e)),
        }
    }
}

/// Writes `bytes` to `path` and waits until they reach the disk.
async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| unavailable(path, "create snapshot", &e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| unavailable(path, "write snapshot", &e))?;
    file.sync_all()
        .await
        .map_err(|e| unavailable(path, "sync snapshot", &e))
}

/// Syncs a directory so renames inside it are durable.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), PersistenceError> {
    tokio::fs::File::open(dir)
        .await
        .map_err(|e| unavailable(dir, "open state directory", &e))?
        .sync_all()
        .await
        .map_err(|e| unavailable(dir, "sync state directory", &e))
}

// Directory handles cannot be synced on this platform.
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), PersistenceError> {
    Ok(())
}

fn unavailable(path: &Path, action: &str, error: &std::io::Error) -> PersistenceError {
    PersistenceError::Unavailable {
        message: format!("failed to {action} at {}: {error}", path.display()),
    }
}

#[async_trait]
impl StatePersistence for FileStatePersistence {
    #[instrument(skip(self, state), fields(workflow_id = %state.id, version = state.version))]
    async fn save(&self, state: &WorkflowState) -> Result<(), PersistenceError> {
        let bytes = encode_snapshot(state)?;
        let _guard = self.write_lock.lock().await;

        let stored = self.read_snapshot(state.id).await?.map(|s| s.version);
        check_version(state, stored)?;

        let path = self.snapshot_path(state.id);
        let tmp = path.with_extension(format!("{SNAPSHOT_EXTENSION}.tmp"));
        write_synced(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| unavailable(&path, "replace snapshot", &e))?;
        sync_dir(&self.dir).await?;

        debug!("snapshot written");
        Ok(())
    }

    async fn load(&self, id: WorkflowId) -> Result<WorkflowState, PersistenceError> {
        self.read_snapshot(id)
            .await?
            .ok_or(PersistenceError::NotFound { workflow_id: id })
    }

    async fn list_active(&self) -> Result<Vec<WorkflowId>, PersistenceError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| unavailable(&self.dir, "list state directory", &e))?;

        let mut active = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable(&self.dir, "list state directory", &e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<WorkflowId>().ok())
            else {
                warn!(path = %path.display(), "skipping file with unrecognized name");
                continue;
            };
            match self.read_snapshot(id).await {
                Ok(Some(state)) if !state.status.is_terminal() => active.push(id),
                Ok(_) => {}
                Err(e) => warn!(workflow_id = %id, error = %e, "skipping unreadable snapshot"),
            }
        }
        active.sort();
        Ok(active)
    }
}
