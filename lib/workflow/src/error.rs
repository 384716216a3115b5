//! Error types for the workflow crate.
//!
//! Errors are layered:
//! - `StateError`: a transition the state machine refuses
//! - `PersistenceError`: failures from a `StatePersistence` backend
//! - `EngineError`: what callers of the engine observe, reported through
//!   `rootcause::Report<EngineError>`
//!
//! Stage failures (`StageFailure`) never show up here; they are absorbed by
//! the recovery policy and only surface as entries in the workflow's error
//! history.

use crate::state::WorkflowStatus;
use stagehand_core::WorkflowId;
use std::fmt;

/// Errors from applying a transition to a `WorkflowState`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The requested status change is not in the transition table.
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    /// A stage result arrived for a stage other than the current one.
    StageOutOfOrder {
        expected: Option<String>,
        actual: String,
    },
    /// The stage already has a recorded output.
    OutputAlreadyRecorded { stage: String },
    /// A loaded snapshot violates a state invariant.
    Corrupt { reason: String },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid state transition from {from} to {to}")
            }
            Self::StageOutOfOrder { expected, actual } => match expected {
                Some(expected) => {
                    write!(f, "stage '{actual}' is out of order, expected '{expected}'")
                }
                None => write!(f, "stage '{actual}' is out of order, no stages remain"),
            },
            Self::OutputAlreadyRecorded { stage } => {
                write!(f, "output for stage '{stage}' is already recorded")
            }
            Self::Corrupt { reason } => write!(f, "corrupt workflow state: {reason}"),
        }
    }
}

impl std::error::Error for StateError {}

/// Errors from state persistence operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// The stored version is not the one the writer expected.
    Conflict {
        workflow_id: WorkflowId,
        expected: u64,
        found: Option<u64>,
    },
    /// No snapshot exists for the workflow.
    NotFound { workflow_id: WorkflowId },
    /// The backend could not be reached or the write did not complete.
    Unavailable { message: String },
    /// A stored snapshot could not be decoded.
    Corrupt { reason: String },
    /// A stored snapshot was written by a newer schema than this build reads.
    UnsupportedSchema { found: u32, supported: u32 },
}

impl PersistenceError {
    /// Returns true if retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict {
                workflow_id,
                expected,
                found,
            } => match found {
                Some(found) => write!(
                    f,
                    "version conflict for {workflow_id}: expected stored version {expected}, found {found}"
                ),
                None => write!(
                    f,
                    "version conflict for {workflow_id}: expected stored version {expected}, found none"
                ),
            },
            Self::NotFound { workflow_id } => write!(f, "no snapshot for {workflow_id}"),
            Self::Unavailable { message } => write!(f, "storage unavailable: {message}"),
            Self::Corrupt { reason } => write!(f, "corrupt snapshot: {reason}"),
            Self::UnsupportedSchema { found, supported } => write!(
                f,
                "snapshot schema version {found} is newer than supported version {supported}"
            ),
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Errors surfaced to callers of the workflow engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The stage sequence or initial context is unusable.
    InvalidConfiguration { reason: String },
    /// The control operation is not legal from the current status.
    InvalidTransition {
        workflow_id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    /// The workflow does not exist.
    NotFound { workflow_id: WorkflowId },
    /// Another driver advanced the workflow first; reload before retrying.
    Conflict {
        workflow_id: WorkflowId,
        reason: String,
    },
    /// Storage stayed unavailable after the bounded retries.
    Persistence {
        workflow_id: WorkflowId,
        reason: String,
    },
    /// A stage in the sequence has no registered processor.
    UnknownStage {
        workflow_id: WorkflowId,
        stage: String,
    },
    /// A snapshot or transition violated a state invariant.
    State {
        workflow_id: WorkflowId,
        source: StateError,
    },
    /// The store could not be listed.
    Storage { reason: String },
}

impl EngineError {
    /// Maps a persistence error into the engine taxonomy.
    #[must_use]
    pub fn from_persistence(workflow_id: WorkflowId, error: PersistenceError) -> Self {
        match error {
            PersistenceError::NotFound { workflow_id } => Self::NotFound { workflow_id },
            PersistenceError::Conflict { .. } => Self::Conflict {
                workflow_id,
                reason: error.to_string(),
            },
            other => Self::Persistence {
                workflow_id,
                reason: other.to_string(),
            },
        }
    }

    /// Maps a refused transition into the engine taxonomy.
    #[must_use]
    pub fn from_state(workflow_id: WorkflowId, error: StateError) -> Self {
        match error {
            StateError::InvalidTransition { from, to } => Self::InvalidTransition {
                workflow_id,
                from,
                to,
            },
            source => Self::State {
                workflow_id,
                source,
            },
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration { reason } => {
                write!(f, "invalid workflow configuration: {reason}")
            }
            Self::InvalidTransition {
                workflow_id,
                from,
                to,
            } => write!(
                f,
                "workflow {workflow_id} cannot transition from {from} to {to}"
            ),
            Self::NotFound { workflow_id } => write!(f, "workflow not found: {workflow_id}"),
            Self::Conflict {
                workflow_id,
                reason,
            } => write!(f, "concurrent modification of workflow {workflow_id}: {reason}"),
            Self::Persistence {
                workflow_id,
                reason,
            } => write!(f, "failed to persist workflow {workflow_id}: {reason}"),
            Self::UnknownStage { workflow_id, stage } => write!(
                f,
                "workflow {workflow_id} references stage '{stage}' with no registered processor"
            ),
            Self::State {
                workflow_id,
                source,
            } => write!(f, "workflow {workflow_id}: {source}"),
            Self::Storage { reason } => write!(f, "workflow store unavailable: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {}
