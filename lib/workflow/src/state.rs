//! Workflow state and its transition rules.
//!
//! `WorkflowState` is the complete, serializable record of one workflow
//! instance. Only the engine's drive loop and control operations mutate it,
//! and only through the methods here, which enforce the state machine:
//!
//! ```text
//! pending -> running -> completed | failed | cancelled
//!            running <-> paused
//!            paused  -> cancelled
//! ```
//!
//! Invariants held by every method:
//! - `current_stage_index <= stage_sequence.len()`, never decreasing
//! - a stage is in `completed_stages` iff it has an entry in `stage_outputs`
//! - recorded outputs and error records are never replaced or removed
//! - terminal states accept no further mutation

use crate::error::StateError;
use crate::stage::{FailureClass, StageFailure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use stagehand_core::WorkflowId;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, not yet started.
    Pending,
    /// Being driven through its stages.
    Running,
    /// Stopped at a stage boundary, resumable.
    Paused,
    /// Every stage produced an output.
    Completed,
    /// Aborted by the recovery policy or by exhausted persistence.
    Failed,
    /// Stopped by a caller.
    Cancelled,
}

impl WorkflowStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns the snake_case name used in snapshots and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true if the transition table allows `self -> to`.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Paused)
                | (Self::Paused, Self::Running)
                | (Self::Running, Self::Cancelled)
                | (Self::Paused, Self::Cancelled)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the recovery policy did about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// The stage was invoked again.
    Retry,
    /// A fallback output was recorded in place of the real one.
    Degrade,
    /// The workflow failed.
    Abort,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Degrade => write!(f, "degrade"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// One entry of the append-only error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The stage that failed.
    pub stage: String,
    /// When the failure was observed.
    pub occurred_at: DateTime<Utc>,
    /// Transient or permanent.
    pub class: FailureClass,
    /// Machine-readable failure kind.
    pub kind: String,
    /// Human-readable failure message.
    pub message: String,
    /// 1-based attempt number that failed.
    pub attempt: u32,
    /// What the recovery policy decided.
    pub action: RecoveryAction,
    /// Fields written by newer builds, carried through unchanged.
    #[serde(flatten)]
    pub extensions: Map<String, JsonValue>,
}

impl ErrorRecord {
    /// Builds a record for a stage failure and the action taken.
    #[must_use]
    pub fn new(stage: &str, failure: &StageFailure, attempt: u32, action: RecoveryAction) -> Self {
        Self {
            stage: stage.to_string(),
            occurred_at: Utc::now(),
            class: failure.class(),
            kind: failure.kind().to_string(),
            message: failure.to_string(),
            attempt,
            action,
            extensions: Map::new(),
        }
    }

    /// Returns true if the failure was replaced by a degraded output.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.action == RecoveryAction::Degrade
    }
}

/// The recorded result of one stage.
///
/// Payloads are opaque to the engine and kept per stage, so two stages can
/// never collide on keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// The processor's payload.
    pub payload: JsonValue,
    /// Schema version of the payload, as declared by the processor.
    pub schema_version: u32,
    /// True if the payload came from a fallback rather than the real stage.
    pub degraded: bool,
    /// When the output was recorded.
    pub produced_at: DateTime<Utc>,
    /// Number of invocations it took, including the successful one.
    pub attempts: u32,
    /// Fields written by newer builds, carried through unchanged.
    #[serde(flatten)]
    pub extensions: Map<String, JsonValue>,
}

impl StageOutput {
    /// An output produced by the stage's primary path.
    #[must_use]
    pub fn primary(payload: JsonValue, schema_version: u32, attempts: u32) -> Self {
        Self {
            payload,
            schema_version,
            degraded: false,
            produced_at: Utc::now(),
            attempts,
            extensions: Map::new(),
        }
    }

    /// An output substituted by a fallback.
    #[must_use]
    pub fn degraded(payload: JsonValue, schema_version: u32, attempts: u32) -> Self {
        Self {
            degraded: true,
            ..Self::primary(payload, schema_version, attempts)
        }
    }
}

/// Complete state of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Immutable instance identifier.
    pub id: WorkflowId,
    /// Ordered stage names, fixed at creation.
    pub stage_sequence: Vec<String>,
    /// Caller-supplied initial context.
    #[serde(default)]
    pub context: JsonValue,
    /// Index of the next stage to run; equals the sequence length once done.
    pub current_stage_index: usize,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Stages whose outputs are durably recorded, in completion order.
    #[serde(default)]
    pub completed_stages: Vec<String>,
    /// Output per completed stage.
    #[serde(default)]
    pub stage_outputs: BTreeMap<String, StageOutput>,
    /// Append-only failure history.
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    /// `100 * current_stage_index / stage_sequence.len()`.
    pub progress_percentage: u8,
    /// Retried failures per stage.
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    /// Bumped on every persisted mutation.
    pub version: u64,
    /// Terminal cause for failed instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance was last mutated.
    pub updated_at: DateTime<Utc>,
    /// When the instance first started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the instance reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Fields written by newer builds, carried through unchanged.
    #[serde(flatten)]
    pub extensions: Map<String, JsonValue>,
}

impl WorkflowState {
    /// Creates a pending, never-persisted state (version 0).
    ///
    /// Callers are expected to have validated the sequence; see
    /// [`validate_stage_sequence`].
    #[must_use]
    pub fn new(id: WorkflowId, stage_sequence: Vec<String>, context: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id,
            stage_sequence,
            context,
            current_stage_index: 0,
            status: WorkflowStatus::Pending,
            completed_stages: Vec::new(),
            stage_outputs: BTreeMap::new(),
            errors: Vec::new(),
            progress_percentage: 0,
            retry_counts: BTreeMap::new(),
            version: 0,
            failure: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            extensions: Map::new(),
        }
    }

    /// Returns the stage the drive loop will run next.
    #[must_use]
    pub fn current_stage(&self) -> Option<&str> {
        self.stage_sequence
            .get(self.current_stage_index)
            .map(String::as_str)
    }

    /// Returns the number of retried failures recorded for a stage.
    #[must_use]
    pub fn retry_count(&self, stage: &str) -> u32 {
        self.retry_counts.get(stage).copied().unwrap_or(0)
    }

    /// Returns the stages whose recorded output is degraded, in completion order.
    #[must_use]
    pub fn degraded_stages(&self) -> Vec<String> {
        self.completed_stages
            .iter()
            .filter(|stage| self.stage_outputs.get(*stage).is_some_and(|o| o.degraded))
            .cloned()
            .collect()
    }

    /// pending -> running.
    pub fn start(&mut self) -> Result<(), StateError> {
        self.transition(WorkflowStatus::Pending, WorkflowStatus::Running)?;
        if self.started_at.is_none() {
            self.started_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// running -> paused.
    pub fn pause(&mut self) -> Result<(), StateError> {
        self.transition(WorkflowStatus::Running, WorkflowStatus::Paused)
    }

    /// paused -> running.
    pub fn resume(&mut self) -> Result<(), StateError> {
        self.transition(WorkflowStatus::Paused, WorkflowStatus::Running)
    }

    /// running | paused -> cancelled.
    pub fn cancel(&mut self) -> Result<(), StateError> {
        self.ensure_can_transition(WorkflowStatus::Cancelled)?;
        self.status = WorkflowStatus::Cancelled;
        self.finish();
        Ok(())
    }

    /// Records the output of the current stage and advances.
    ///
    /// Transitions to `completed` when the last stage is recorded.
    pub fn record_stage_output(&mut self, stage: &str, output: StageOutput) -> Result<(), StateError> {
        self.ensure_can_record(stage)?;

        self.stage_outputs.insert(stage.to_string(), output);
        self.completed_stages.push(stage.to_string());
        self.current_stage_index += 1;
        self.recompute_progress();
        self.touch();

        if self.current_stage_index == self.stage_sequence.len() {
            self.status = WorkflowStatus::Completed;
            self.finish();
        }
        Ok(())
    }

    /// Records a failure that will be retried and bumps the stage's retry count.
    pub fn record_retry(&mut self, record: ErrorRecord) -> Result<(), StateError> {
        self.ensure_status(WorkflowStatus::Running, WorkflowStatus::Running)?;
        *self.retry_counts.entry(record.stage.clone()).or_insert(0) += 1;
        self.errors.push(record);
        self.touch();
        Ok(())
    }

    /// Records a failure answered with a degraded output, then advances.
    pub fn record_degraded(
        &mut self,
        record: ErrorRecord,
        output: StageOutput,
    ) -> Result<(), StateError> {
        self.ensure_can_record(&record.stage)?;
        let stage = record.stage.clone();
        self.errors.push(record);
        self.record_stage_output(&stage, output)
    }

    /// running -> failed, appending the failure that caused it if there is one.
    pub fn fail(&mut self, record: Option<ErrorRecord>, cause: String) -> Result<(), StateError> {
        self.ensure_can_transition(WorkflowStatus::Failed)?;
        if let Some(record) = record {
            self.errors.push(record);
        }
        self.status = WorkflowStatus::Failed;
        self.failure = Some(cause);
        self.finish();
        Ok(())
    }

    /// pending | running | paused -> failed, because the state could not be
    /// persisted.
    ///
    /// Storage loss ends the instance from any live status, including the
    /// ones `fail` refuses, so a drive that never got its first write through
    /// still leaves a terminal cause behind.
    pub fn fail_storage(&mut self, cause: String) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::InvalidTransition {
                from: self.status,
                to: WorkflowStatus::Failed,
            });
        }
        self.status = WorkflowStatus::Failed;
        self.failure = Some(cause);
        self.finish();
        Ok(())
    }

    /// Checks the structural invariants of a snapshot.
    pub fn validate(&self) -> Result<(), StateError> {
        validate_stage_sequence(&self.stage_sequence).map_err(|reason| StateError::Corrupt {
            reason: reason.to_string(),
        })?;
        if self.current_stage_index > self.stage_sequence.len() {
            return Err(StateError::Corrupt {
                reason: format!(
                    "stage index {} past end of {} stages",
                    self.current_stage_index,
                    self.stage_sequence.len()
                ),
            });
        }
        if self.completed_stages.len() != self.stage_outputs.len()
            || self
                .completed_stages
                .iter()
                .any(|stage| !self.stage_outputs.contains_key(stage))
        {
            return Err(StateError::Corrupt {
                reason: "completed stages and stage outputs disagree".to_string(),
            });
        }
        if (self.status == WorkflowStatus::Completed)
            != (self.current_stage_index == self.stage_sequence.len())
        {
            return Err(StateError::Corrupt {
                reason: format!(
                    "status {} at stage index {} of {}",
                    self.status,
                    self.current_stage_index,
                    self.stage_sequence.len()
                ),
            });
        }
        Ok(())
    }

    /// Builds the read-only status view.
    #[must_use]
    pub fn status_report(&self) -> WorkflowStatusReport {
        WorkflowStatusReport {
            workflow_id: self.id,
            status: self.status,
            progress_percentage: self.progress_percentage,
            current_stage: self.current_stage().map(str::to_string),
            completed_stages: self.completed_stages.clone(),
            errors: self.errors.clone(),
            version: self.version,
        }
    }

    /// Builds the end-of-run summary.
    #[must_use]
    pub fn summary(&self) -> WorkflowSummary {
        let degraded_stages = self.degraded_stages();
        let ready_for_execution = self.status == WorkflowStatus::Completed
            && degraded_stages.is_empty()
            && self
                .stage_sequence
                .iter()
                .all(|stage| self.stage_outputs.contains_key(stage));
        WorkflowSummary {
            workflow_id: self.id,
            status: self.status,
            stages_completed: self.completed_stages.clone(),
            degraded_stages,
            total_errors: self.errors.len(),
            ready_for_execution,
            failure: self.failure.clone(),
        }
    }

    fn transition(&mut self, from: WorkflowStatus, to: WorkflowStatus) -> Result<(), StateError> {
        self.ensure_status(from, to)?;
        self.status = to;
        self.touch();
        Ok(())
    }

    fn ensure_status(&self, expected: WorkflowStatus, to: WorkflowStatus) -> Result<(), StateError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(StateError::InvalidTransition {
                from: self.status,
                to,
            })
        }
    }

    fn ensure_can_record(&self, stage: &str) -> Result<(), StateError> {
        self.ensure_status(WorkflowStatus::Running, WorkflowStatus::Running)?;
        match self.current_stage() {
            Some(current) if current == stage => {}
            expected => {
                return Err(StateError::StageOutOfOrder {
                    expected: expected.map(str::to_string),
                    actual: stage.to_string(),
                });
            }
        }
        if self.stage_outputs.contains_key(stage) {
            return Err(StateError::OutputAlreadyRecorded {
                stage: stage.to_string(),
            });
        }
        Ok(())
    }

    fn ensure_can_transition(&self, to: WorkflowStatus) -> Result<(), StateError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(StateError::InvalidTransition {
                from: self.status,
                to,
            })
        }
    }

    fn recompute_progress(&mut self) {
        let total = self.stage_sequence.len().max(1);
        let progress = (100 * self.current_stage_index / total).min(100);
        self.progress_percentage = self.progress_percentage.max(progress as u8);
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn finish(&mut self) {
        self.touch();
        self.finished_at = Some(self.updated_at);
    }
}

/// Checks a stage sequence supplied at creation.
///
/// Returns the reason the sequence is unusable.
pub fn validate_stage_sequence(stages: &[String]) -> Result<(), String> {
    if stages.is_empty() {
        return Err("stage sequence is empty".to_string());
    }
    let mut seen = HashSet::with_capacity(stages.len());
    for stage in stages {
        if stage.trim().is_empty() {
            return Err("stage names must not be blank".to_string());
        }
        if !seen.insert(stage.as_str()) {
            return Err(format!("stage '{stage}' appears more than once"));
        }
    }
    Ok(())
}

/// Read-only view returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    /// The instance reported on.
    pub workflow_id: WorkflowId,
    /// Lifecycle status at the last persisted write.
    pub status: WorkflowStatus,
    /// Share of stages with a recorded output, 0 to 100.
    pub progress_percentage: u8,
    /// The stage the drive loop will run next, if any remain.
    pub current_stage: Option<String>,
    /// Stages with a recorded output, in completion order.
    pub completed_stages: Vec<String>,
    /// The full failure history.
    pub errors: Vec<ErrorRecord>,
    /// Version of the snapshot this view was built from.
    pub version: u64,
}

/// End-of-run summary of a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// The instance summarized.
    pub workflow_id: WorkflowId,
    /// Final (or current) lifecycle status.
    pub status: WorkflowStatus,
    /// Stages with a recorded output, in completion order.
    pub stages_completed: Vec<String>,
    /// Stages whose output is a fallback estimate.
    pub degraded_stages: Vec<String>,
    /// Number of entries in the failure history.
    pub total_errors: usize,
    /// Completed cleanly: every stage has a real output.
    pub ready_for_execution: bool,
    /// Terminal cause, for failed instances.
    pub failure: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stages(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn running(names: &[&str]) -> WorkflowState {
        let mut state = WorkflowState::new(WorkflowId::new(), stages(names), json!({}));
        state.start().unwrap();
        state
    }

    fn output(value: JsonValue) -> StageOutput {
        StageOutput::primary(value, 1, 1)
    }

    fn transient() -> StageFailure {
        StageFailure::Network {
            message: "connection reset".to_string(),
        }
    }

    #[test]
    fn status_terminal() {
        assert!(!WorkflowStatus::Pending.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
    }

    #[test]
    fn transition_table() {
        use WorkflowStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Cancelled));
        assert!(!Paused.can_transition_to(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            for to in [Pending, Running, Paused, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn start_sets_started_at() {
        let mut state = WorkflowState::new(WorkflowId::new(), stages(&["a"]), json!(null));
        assert!(state.started_at.is_none());
        state.start().unwrap();
        assert_eq!(state.status, WorkflowStatus::Running);
        assert!(state.started_at.is_some());
        assert!(state.start().is_err());
    }

    #[test]
    fn outputs_advance_and_complete() {
        let mut state = running(&["analyze", "plan", "notify"]);

        state.record_stage_output("analyze", output(json!(1))).unwrap();
        assert_eq!(state.current_stage(), Some("plan"));
        assert_eq!(state.progress_percentage, 33);

        state.record_stage_output("plan", output(json!(2))).unwrap();
        assert_eq!(state.progress_percentage, 66);
        assert_eq!(state.status, WorkflowStatus::Running);

        state.record_stage_output("notify", output(json!(3))).unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.progress_percentage, 100);
        assert_eq!(state.current_stage(), None);
        assert!(state.finished_at.is_some());
        assert_eq!(state.completed_stages, stages(&["analyze", "plan", "notify"]));
        state.validate().unwrap();
    }

    #[test]
    fn out_of_order_output_is_rejected() {
        let mut state = running(&["analyze", "plan"]);
        let err = state.record_stage_output("plan", output(json!(1))).unwrap_err();
        assert_eq!(
            err,
            StateError::StageOutOfOrder {
                expected: Some("analyze".to_string()),
                actual: "plan".to_string(),
            }
        );
        assert!(state.stage_outputs.is_empty());
    }

    #[test]
    fn retry_bumps_count_and_keeps_index() {
        let mut state = running(&["analyze", "plan"]);
        state
            .record_retry(ErrorRecord::new("analyze", &transient(), 1, RecoveryAction::Retry))
            .unwrap();
        state
            .record_retry(ErrorRecord::new("analyze", &transient(), 2, RecoveryAction::Retry))
            .unwrap();
        assert_eq!(state.retry_count("analyze"), 2);
        assert_eq!(state.retry_count("plan"), 0);
        assert_eq!(state.current_stage_index, 0);
        assert_eq!(state.errors.len(), 2);
        assert_eq!(state.errors[1].attempt, 2);
        assert_eq!(state.errors[0].class, FailureClass::Transient);
    }

    #[test]
    fn degraded_output_is_marked_and_summarized() {
        let mut state = running(&["analyze", "seo"]);
        state.record_stage_output("analyze", output(json!({}))).unwrap();
        let failure = StageFailure::Unrecoverable {
            message: "sitemap missing".to_string(),
        };
        state
            .record_degraded(
                ErrorRecord::new("seo", &failure, 1, RecoveryAction::Degrade),
                StageOutput::degraded(json!({ "estimated": true }), 1, 1),
            )
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.degraded_stages(), stages(&["seo"]));
        assert!(state.errors[0].is_degraded());

        let summary = state.summary();
        assert_eq!(summary.total_errors, 1);
        assert!(!summary.ready_for_execution);
    }

    #[test]
    fn clean_completion_is_ready_for_execution() {
        let mut state = running(&["analyze"]);
        state.record_stage_output("analyze", output(json!({}))).unwrap();
        let summary = state.summary();
        assert!(summary.ready_for_execution);
        assert!(summary.degraded_stages.is_empty());
    }

    #[test]
    fn fail_is_terminal() {
        let mut state = running(&["analyze", "notify"]);
        state.record_stage_output("analyze", output(json!({}))).unwrap();
        let failure = StageFailure::InvalidInput {
            message: "no recipients".to_string(),
        };
        state
            .fail(
                Some(ErrorRecord::new("notify", &failure, 1, RecoveryAction::Abort)),
                failure.to_string(),
            )
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.current_stage_index, 1);
        assert_eq!(state.failure.as_deref(), Some("invalid input: no recipients"));

        let before = state.clone();
        assert!(state.pause().is_err());
        assert!(state.cancel().is_err());
        assert!(state.record_stage_output("notify", output(json!({}))).is_err());
        assert!(
            state
                .record_retry(ErrorRecord::new("notify", &failure, 2, RecoveryAction::Retry))
                .is_err()
        );
        assert_eq!(state, before);
    }

    #[test]
    fn storage_failure_ends_any_live_status() {
        let mut pending = WorkflowState::new(WorkflowId::new(), stages(&["a"]), json!({}));
        assert!(pending.fail(None, "x".to_string()).is_err());
        pending.fail_storage("disk full".to_string()).unwrap();
        assert_eq!(pending.status, WorkflowStatus::Failed);
        assert_eq!(pending.failure.as_deref(), Some("disk full"));
        assert!(pending.finished_at.is_some());
        pending.validate().unwrap();

        let mut paused = running(&["a", "b"]);
        paused.pause().unwrap();
        paused.fail_storage("disk full".to_string()).unwrap();
        assert_eq!(paused.status, WorkflowStatus::Failed);

        let mut done = running(&["a"]);
        done.record_stage_output("a", output(json!({}))).unwrap();
        assert!(done.fail_storage("disk full".to_string()).is_err());
        assert_eq!(done.status, WorkflowStatus::Completed);
    }

    #[test]
    fn pause_resume_cancel() {
        let mut state = running(&["analyze", "plan"]);
        state.pause().unwrap();
        assert_eq!(state.status, WorkflowStatus::Paused);
        assert!(state.pause().is_err());
        state.resume().unwrap();
        assert_eq!(state.status, WorkflowStatus::Running);
        state.pause().unwrap();
        state.cancel().unwrap();
        assert_eq!(state.status, WorkflowStatus::Cancelled);
        assert!(state.finished_at.is_some());
        assert!(state.resume().is_err());
    }

    #[test]
    fn pending_cannot_be_cancelled() {
        let mut state = WorkflowState::new(WorkflowId::new(), stages(&["a"]), json!({}));
        assert_eq!(
            state.cancel().unwrap_err(),
            StateError::InvalidTransition {
                from: WorkflowStatus::Pending,
                to: WorkflowStatus::Cancelled,
            }
        );
    }

    #[test]
    fn sequence_validation() {
        assert!(validate_stage_sequence(&[]).is_err());
        assert!(validate_stage_sequence(&stages(&["a", "b", "a"])).is_err());
        assert!(validate_stage_sequence(&stages(&["a", " "])).is_err());
        assert!(validate_stage_sequence(&stages(&["a", "b"])).is_ok());
    }

    #[test]
    fn validate_detects_corruption() {
        let mut state = running(&["analyze", "plan"]);
        state.completed_stages.push("analyze".to_string());
        assert!(matches!(state.validate(), Err(StateError::Corrupt { .. })));

        let mut state = running(&["analyze"]);
        state.current_stage_index = 5;
        assert!(matches!(state.validate(), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let state = running(&["analyze"]);
        let mut json = serde_json::to_value(&state).unwrap();
        json["added_by_newer_build"] = json!({ "priority": "high" });

        let parsed: WorkflowState = serde_json::from_value(json).unwrap();
        assert_eq!(
            parsed.extensions.get("added_by_newer_build"),
            Some(&json!({ "priority": "high" }))
        );

        let written = serde_json::to_value(&parsed).unwrap();
        assert_eq!(written["added_by_newer_build"]["priority"], "high");
    }

    #[test]
    fn unknown_fields_survive_in_nested_records() {
        let mut output_json = serde_json::to_value(output(json!({}))).unwrap();
        output_json["model_id"] = json!("planner-v2");
        let parsed: StageOutput = serde_json::from_value(output_json).unwrap();
        assert_eq!(parsed.extensions["model_id"], "planner-v2");
        assert_eq!(serde_json::to_value(&parsed).unwrap()["model_id"], "planner-v2");

        let record = ErrorRecord::new("analyze", &transient(), 1, RecoveryAction::Retry);
        let mut record_json = serde_json::to_value(&record).unwrap();
        record_json["trace_id"] = json!("abc123");
        let parsed: ErrorRecord = serde_json::from_value(record_json).unwrap();
        assert_eq!(parsed.class, FailureClass::Transient);
        assert_eq!(serde_json::to_value(&parsed).unwrap()["trace_id"], "abc123");
    }

    #[test]
    fn status_report_reflects_state() {
        let mut state = running(&["analyze", "plan"]);
        state.record_stage_output("analyze", output(json!({}))).unwrap();
        let report = state.status_report();
        assert_eq!(report.status, WorkflowStatus::Running);
        assert_eq!(report.progress_percentage, 50);
        assert_eq!(report.current_stage.as_deref(), Some("plan"));
        assert_eq!(report.completed_stages, stages(&["analyze"]));
    }
}
