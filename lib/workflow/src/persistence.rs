//! Durable snapshot storage for workflow state.
//!
//! Backends store one snapshot per workflow id and enforce optimistic
//! concurrency on every write: a snapshot carrying `version = n` is only
//! accepted if the stored snapshot has version `n - 1` (or, for `n == 1`,
//! if nothing is stored yet). The loser of a race gets
//! `PersistenceError::Conflict` and must reload.

use crate::envelope::{decode_snapshot, encode_snapshot};
use crate::error::PersistenceError;
use crate::state::WorkflowState;
use async_trait::async_trait;
use stagehand_core::WorkflowId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Trait for durable storage of workflow snapshots.
#[async_trait]
pub trait StatePersistence: Send + Sync {
    /// Atomically upserts the snapshot keyed by `state.id`.
    ///
    /// Fails with `Conflict` unless the stored version is `state.version - 1`.
    async fn save(&self, state: &WorkflowState) -> Result<(), PersistenceError>;

    /// Loads the latest snapshot.
    async fn load(&self, id: WorkflowId) -> Result<WorkflowState, PersistenceError>;

    /// Lists ids whose status is not terminal, oldest first.
    async fn list_active(&self) -> Result<Vec<WorkflowId>, PersistenceError>;
}

#[async_trait]
impl<T: StatePersistence + ?Sized> StatePersistence for Arc<T> {
    async fn save(&self, state: &WorkflowState) -> Result<(), PersistenceError> {
        (**self).save(state).await
    }

    async fn load(&self, id: WorkflowId) -> Result<WorkflowState, PersistenceError> {
        (**self).load(id).await
    }

    async fn list_active(&self) -> Result<Vec<WorkflowId>, PersistenceError> {
        (**self).list_active().await
    }
}

/// Checks a write of `incoming` against the currently stored version.
///
/// # Errors
///
/// Returns `Conflict` if `incoming.version` does not directly follow `stored`.
pub fn check_version(incoming: &WorkflowState, stored: Option<u64>) -> Result<(), PersistenceError> {
    let expected = incoming.version.checked_sub(1);
    let accepted = match (stored, expected) {
        (None, Some(0)) => true,
        (Some(found), Some(expected)) => found == expected,
        _ => false,
    };
    if accepted {
        Ok(())
    } else {
        Err(PersistenceError::Conflict {
            workflow_id: incoming.id,
            expected: expected.unwrap_or(0),
            found: stored,
        })
    }
}

/// In-memory persistence, for tests and single-process hosts.
///
/// Snapshots are kept encoded, exactly as a durable backend would store
/// them, so the envelope and unknown-field handling are exercised too.
#[derive(Debug, Default)]
pub struct InMemoryStatePersistence {
    snapshots: RwLock<HashMap<WorkflowId, Vec<u8>>>,
}

impl InMemoryStatePersistence {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored snapshots.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl StatePersistence for InMemoryStatePersistence {
    async fn save(&self, state: &WorkflowState) -> Result<(), PersistenceError> {
        let bytes = encode_snapshot(state)?;
        let mut snapshots = self.snapshots.write().await;
        let stored = match snapshots.get(&state.id) {
            Some(existing) => Some(decode_snapshot(existing)?.version),
            None => None,
        };
        check_version(state, stored)?;
        snapshots.insert(state.id, bytes);
        Ok(())
    }

    async fn load(&self, id: WorkflowId) -> Result<WorkflowState, PersistenceError> {
        let snapshots = self.snapshots.read().await;
        let bytes = snapshots
            .get(&id)
            .ok_or(PersistenceError::NotFound { workflow_id: id })?;
        decode_snapshot(bytes)
    }

    async fn list_active(&self) -> Result<Vec<WorkflowId>, PersistenceError> {
        let snapshots = self.snapshots.read().await;
        let mut active = Vec::new();
        for bytes in snapshots.values() {
            let state = decode_snapshot(bytes)?;
            if !state.status.is_terminal() {
                active.push(state.id);
            }
        }
        active.sort();
        Ok(active)
    }
}
