//! Staged workflow engine for stagehand.
//!
//! This crate drives a migration workflow through an ordered list of stages,
//! including:
//!
//! - **State**: the versioned, serializable `WorkflowState` and its transition rules
//! - **Stages**: the `StageProcessor` capability and the `StageRegistry`
//! - **Recovery**: classifying stage failures into retry, degrade or abort
//! - **Persistence**: snapshot storage with optimistic version checks
//! - **Engine**: the drive loop and the pause, resume, cancel and status operations

pub mod config;
pub mod control;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod file_store;
pub mod persistence;
pub mod recovery;
pub mod stage;
pub mod state;

pub use config::EngineConfig;
pub use control::{ControlRegistry, ControlRequest, DriveGuard};
pub use engine::{ControlOutcome, SweepReport, WorkflowEngine};
pub use envelope::{CURRENT_SCHEMA_VERSION, SnapshotEnvelope};
pub use error::{EngineError, PersistenceError, StateError};
pub use file_store::FileStatePersistence;
pub use persistence::{InMemoryStatePersistence, StatePersistence};
pub use recovery::{DefaultRecoveryPolicy, FailureContext, RecoveryDecision, RecoveryPolicy};
pub use stage::{FailureClass, FallbackSource, StageFailure, StageInput, StageProcessor, StageRegistry};
pub use state::{
    ErrorRecord, RecoveryAction, StageOutput, WorkflowState, WorkflowStatus, WorkflowStatusReport,
    WorkflowSummary,
};
