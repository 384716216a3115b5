//! The workflow engine: drive loop and control operations.
//!
//! The engine sequences stage processors over a persisted `WorkflowState`:
//!
//! 1. Load the latest snapshot and claim the workflow in the control registry
//! 2. Run the current stage under the watchdog timeout
//! 3. On success, record the output and persist
//! 4. On failure, ask the recovery policy and record the retry, degraded
//!    output or abort, then persist
//! 5. At every stage boundary, honour a parked pause or cancel request
//!
//! Every transition is applied to a copy of the state and only adopted once
//! the write succeeds, so the in-memory state never runs ahead of storage.

use crate::config::EngineConfig;
use crate::control::{ControlRegistry, ControlRequest, DriveGuard};
use crate::error::{EngineError, StateError};
use crate::persistence::StatePersistence;
use crate::recovery::{DefaultRecoveryPolicy, FailureContext, RecoveryDecision, RecoveryPolicy};
use crate::stage::{FallbackSource, StageFailure, StageInput, StageProcessor, StageRegistry};
use crate::state::{
    ErrorRecord, RecoveryAction, StageOutput, WorkflowState, WorkflowStatus, WorkflowStatusReport,
    WorkflowSummary, validate_stage_sequence,
};
use futures::future::join_all;
use serde_json::Value as JsonValue;
use stagehand_core::WorkflowId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

type EngineResult<T> = stagehand_core::Result<T, EngineError>;

/// Result of a pause or cancel call.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    /// The workflow is being driven; the request takes effect at the next
    /// stage boundary.
    ///
    /// Advisory: if the in-flight stage was the last one, or it ends the
    /// workflow, the drive finishes first and the request is dropped. Check
    /// the state `run` returns (or `status`) for the outcome.
    Requested,
    /// The transition was applied to the stored snapshot.
    Applied(WorkflowState),
}

/// Per-instance results of a recovery sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Instances driven to a terminal or paused state.
    pub resumed: Vec<WorkflowSummary>,
    /// Active instances left alone (pending or paused).
    pub skipped: Vec<WorkflowId>,
    /// Instances whose drive returned an error.
    pub failed: Vec<(WorkflowId, String)>,
}

/// Drives workflow instances through their stages.
pub struct WorkflowEngine<P, R = DefaultRecoveryPolicy> {
    persistence: P,
    stages: StageRegistry,
    policy: R,
    config: EngineConfig,
    control: ControlRegistry,
}

impl<P: StatePersistence> WorkflowEngine<P> {
    /// Creates an engine with the default recovery policy built from `config`.
    #[must_use]
    pub fn new(persistence: P, stages: StageRegistry, config: EngineConfig) -> Self {
        let policy = DefaultRecoveryPolicy::from_config(&config);
        Self::with_policy(persistence, stages, policy, config)
    }
}

impl<P: StatePersistence, R: RecoveryPolicy> WorkflowEngine<P, R> {
    /// Creates an engine with a custom recovery policy.
    #[must_use]
    pub fn with_policy(persistence: P, stages: StageRegistry, policy: R, config: EngineConfig) -> Self {
        Self {
            persistence,
            stages,
            policy,
            config,
            control: ControlRegistry::new(),
        }
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The registered stage processors.
    #[must_use]
    pub fn stages(&self) -> &StageRegistry {
        &self.stages
    }

    /// The registry of workflows this engine is driving.
    #[must_use]
    pub fn control(&self) -> &ControlRegistry {
        &self.control
    }

    /// Creates and persists a pending workflow.
    ///
    /// The context must be a JSON object (or null, read as an empty object).
    #[instrument(skip_all, fields(stages = stage_sequence.len()))]
    pub async fn create(
        &self,
        stage_sequence: Vec<String>,
        context: JsonValue,
    ) -> EngineResult<WorkflowId> {
        validate_stage_sequence(&stage_sequence)
            .map_err(|reason| EngineError::InvalidConfiguration { reason })?;
        if let Some(stage) = self.stages.first_missing(&stage_sequence) {
            return Err(EngineError::InvalidConfiguration {
                reason: format!("no processor registered for stage '{stage}'"),
            }
            .into());
        }
        let context = match context {
            JsonValue::Null => JsonValue::Object(serde_json::Map::new()),
            JsonValue::Object(map) => JsonValue::Object(map),
            other => {
                return Err(EngineError::InvalidConfiguration {
                    reason: format!("initial context must be an object, got {other}"),
                }
                .into());
            }
        };

        let mut state = WorkflowState::new(WorkflowId::new(), stage_sequence, context);
        self.persist(&mut state).await?;
        info!(workflow_id = %state.id, "workflow created");
        Ok(state.id)
    }

    /// Loads the latest snapshot and drives it until it is terminal or paused.
    #[instrument(skip(self, id), fields(workflow_id = %id))]
    pub async fn run(&self, id: WorkflowId) -> EngineResult<WorkflowState> {
        let state = self.load(id).await?;
        self.drive_loaded(state).await
    }

    /// Drives a snapshot the caller already holds.
    ///
    /// The snapshot's version must match the stored one; a stale snapshot is
    /// reported as a conflict and never written.
    #[instrument(skip_all, fields(workflow_id = %state.id, version = state.version))]
    pub async fn drive(&self, state: WorkflowState) -> EngineResult<WorkflowState> {
        let stored = self.load(state.id).await?;
        if stored.version != state.version {
            return Err(EngineError::Conflict {
                workflow_id: state.id,
                reason: format!(
                    "snapshot is at version {}, stored version is {}",
                    state.version, stored.version
                ),
            }
            .into());
        }
        state
            .validate()
            .map_err(|e| EngineError::from_state(state.id, e))?;
        self.drive_loaded(state).await
    }

    /// Pauses a running workflow.
    ///
    /// A workflow this engine is driving is paused at the next stage
    /// boundary; otherwise the stored snapshot is paused directly.
    #[instrument(skip(self, id), fields(workflow_id = %id))]
    pub async fn pause(&self, id: WorkflowId) -> EngineResult<ControlOutcome> {
        let mut state = self.load(id).await?;
        if state.status != WorkflowStatus::Running {
            return Err(EngineError::InvalidTransition {
                workflow_id: id,
                from: state.status,
                to: WorkflowStatus::Paused,
            }
            .into());
        }
        if self.control.request(id, ControlRequest::Pause) {
            info!("pause requested");
            return Ok(ControlOutcome::Requested);
        }
        self.transition(&mut state, WorkflowState::pause).await?;
        info!(version = state.version, "workflow paused");
        Ok(ControlOutcome::Applied(state))
    }

    /// Marks a paused workflow running again.
    ///
    /// This only flips the stored status; call `run` (or let the recovery
    /// sweep pick it up) to continue from the current stage.
    #[instrument(skip(self, id), fields(workflow_id = %id))]
    pub async fn resume(&self, id: WorkflowId) -> EngineResult<WorkflowState> {
        let mut state = self.load(id).await?;
        self.transition(&mut state, WorkflowState::resume).await?;
        info!(version = state.version, "workflow resumed");
        Ok(state)
    }

    /// Cancels a running or paused workflow.
    #[instrument(skip(self, id), fields(workflow_id = %id))]
    pub async fn cancel(&self, id: WorkflowId) -> EngineResult<ControlOutcome> {
        let mut state = self.load(id).await?;
        if !state.status.can_transition_to(WorkflowStatus::Cancelled) {
            return Err(EngineError::InvalidTransition {
                workflow_id: id,
                from: state.status,
                to: WorkflowStatus::Cancelled,
            }
            .into());
        }
        if state.status == WorkflowStatus::Running
            && self.control.request(id, ControlRequest::Cancel)
        {
            info!("cancel requested");
            return Ok(ControlOutcome::Requested);
        }
        self.transition(&mut state, WorkflowState::cancel).await?;
        info!(version = state.version, "workflow cancelled");
        Ok(ControlOutcome::Applied(state))
    }

    /// Returns the status view of the last persisted snapshot.
    pub async fn status(&self, id: WorkflowId) -> EngineResult<WorkflowStatusReport> {
        Ok(self.load(id).await?.status_report())
    }

    /// Returns the summary of the last persisted snapshot.
    pub async fn summary(&self, id: WorkflowId) -> EngineResult<WorkflowSummary> {
        Ok(self.load(id).await?.summary())
    }

    async fn load(&self, id: WorkflowId) -> Result<WorkflowState, EngineError> {
        self.persistence
            .load(id)
            .await
            .map_err(|e| EngineError::from_persistence(id, e))
    }

    async fn drive_loaded(&self, mut state: WorkflowState) -> EngineResult<WorkflowState> {
        let id = state.id;
        if state.status.is_terminal() {
            debug!(status = %state.status, "workflow already finished");
            return Ok(state);
        }
        if let Some(stage) = self
            .stages
            .first_missing(state.stage_sequence.iter().skip(state.current_stage_index))
        {
            return Err(EngineError::UnknownStage {
                workflow_id: id,
                stage: stage.to_string(),
            }
            .into());
        }
        let guard = self.control.claim(id).ok_or_else(|| EngineError::Conflict {
            workflow_id: id,
            reason: "workflow is already being driven by this engine".to_string(),
        })?;

        match self.drive_claimed(&mut state, &guard).await {
            Ok(()) => Ok(state),
            Err(EngineError::Persistence { workflow_id, reason }) => {
                error!(%reason, "persistence retries exhausted, failing workflow");
                self.fail_unpersisted(&mut state, &reason).await;
                Err(EngineError::Persistence {
                    workflow_id,
                    reason,
                }
                .into())
            }
            Err(e) => {
                warn!(error = %e, "drive stopped");
                Err(e.into())
            }
        }
    }

    async fn drive_claimed(
        &self,
        state: &mut WorkflowState,
        guard: &DriveGuard,
    ) -> Result<(), EngineError> {
        match state.status {
            WorkflowStatus::Pending => {
                self.transition(state, WorkflowState::start).await?;
                info!(drive_id = %guard.drive_id(), version = state.version, "workflow started");
            }
            WorkflowStatus::Paused => {
                self.transition(state, WorkflowState::resume).await?;
                info!(drive_id = %guard.drive_id(), version = state.version, "workflow resumed");
            }
            _ => {
                // Writing the unchanged snapshot claims the next version, so a
                // stale driver elsewhere loses its next save.
                self.transition(state, |_| Ok(())).await?;
                info!(drive_id = %guard.drive_id(), version = state.version, "workflow picked up");
            }
        }

        loop {
            match guard.take_request() {
                Some(ControlRequest::Pause) => {
                    self.transition(state, WorkflowState::pause).await?;
                    info!(version = state.version, "workflow paused");
                    return Ok(());
                }
                Some(ControlRequest::Cancel) => {
                    self.transition(state, WorkflowState::cancel).await?;
                    info!(version = state.version, "workflow cancelled");
                    return Ok(());
                }
                None => {}
            }

            let Some(stage) = state.current_stage().map(str::to_string) else {
                return Ok(());
            };
            self.run_stage(state, &stage).await?;

            if state.status.is_terminal() {
                if state.status == WorkflowStatus::Completed {
                    info!(version = state.version, "workflow completed");
                }
                if let Some(request) = guard.take_request() {
                    info!(
                        ?request,
                        status = %state.status,
                        "workflow finished before the control request took effect"
                    );
                }
                return Ok(());
            }
        }
    }

    #[instrument(skip(self, state), fields(workflow_id = %state.id))]
    async fn run_stage(&self, state: &mut WorkflowState, stage: &str) -> Result<(), EngineError> {
        let processor = Arc::clone(self.stages.get(stage).ok_or_else(|| {
            EngineError::UnknownStage {
                workflow_id: state.id,
                stage: stage.to_string(),
            }
        })?);

        loop {
            let attempt = state.retry_count(stage) + 1;
            debug!(attempt, "invoking stage");

            let failure = match self.invoke(state, stage, attempt, processor.as_ref()).await {
                Ok(payload) => {
                    let output =
                        StageOutput::primary(payload, processor.output_schema_version(), attempt);
                    self.transition(state, |s| s.record_stage_output(stage, output))
                        .await?;
                    info!(
                        attempt,
                        progress = state.progress_percentage,
                        version = state.version,
                        "stage completed"
                    );
                    return Ok(());
                }
                Err(failure) => failure,
            };

            let decision = self.policy.decide(&FailureContext {
                stage,
                failure: &failure,
                retries_so_far: state.retry_count(stage),
                fallback_available: self.stages.fallback_source(stage).is_some(),
                total_errors: state.errors.len(),
            });
            let record = ErrorRecord::new(stage, &failure, attempt, decision.action());

            match decision {
                RecoveryDecision::Retry { delay } => {
                    warn!(
                        attempt,
                        class = %failure.class(),
                        delay_ms = duration_ms(delay),
                        error = %failure,
                        "stage failed, retrying"
                    );
                    self.transition(state, |s| s.record_retry(record)).await?;
                    tokio::time::sleep(delay).await;
                }
                RecoveryDecision::Degrade => {
                    return self
                        .degrade(state, stage, attempt, processor.as_ref(), record)
                        .await;
                }
                RecoveryDecision::Abort => {
                    error!(attempt, class = %failure.class(), error = %failure, "stage failed, aborting");
                    let cause = format!("stage '{stage}' failed: {failure}");
                    return self
                        .transition(state, |s| s.fail(Some(record), cause))
                        .await;
                }
            }
        }
    }

    async fn invoke(
        &self,
        state: &WorkflowState,
        stage: &str,
        attempt: u32,
        processor: &dyn StageProcessor,
    ) -> Result<JsonValue, StageFailure> {
        let input = StageInput {
            workflow_id: state.id,
            stage,
            attempt,
            context: &state.context,
            outputs: &state.stage_outputs,
        };
        self.watchdog(processor.execute(&input)).await
    }

    async fn watchdog<F>(&self, call: F) -> Result<JsonValue, StageFailure>
    where
        F: Future<Output = Result<JsonValue, StageFailure>>,
    {
        let timeout = self.config.stage_timeout();
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or_else(|_| Err(StageFailure::Timeout {
                after_ms: duration_ms(timeout),
            }))
    }

    async fn degrade(
        &self,
        state: &mut WorkflowState,
        stage: &str,
        attempt: u32,
        processor: &dyn StageProcessor,
        mut record: ErrorRecord,
    ) -> Result<(), EngineError> {
        let fallback = {
            let input = StageInput {
                workflow_id: state.id,
                stage,
                attempt,
                context: &state.context,
                outputs: &state.stage_outputs,
            };
            match self.stages.fallback_source(stage) {
                Some(FallbackSource::Processor) => self.watchdog(processor.fallback(&input)).await,
                Some(FallbackSource::Registered) => self
                    .stages
                    .default_fallback(stage)
                    .cloned()
                    .ok_or_else(|| no_fallback(stage)),
                None => Err(no_fallback(stage)),
            }
        };

        match fallback {
            Ok(payload) => {
                let message = record.message.clone();
                let output =
                    StageOutput::degraded(payload, processor.output_schema_version(), attempt);
                self.transition(state, |s| s.record_degraded(record, output))
                    .await?;
                warn!(
                    attempt,
                    error = %message,
                    version = state.version,
                    "stage degraded to fallback output"
                );
                Ok(())
            }
            Err(fallback_failure) => {
                error!(attempt, error = %fallback_failure, "stage fallback failed, aborting");
                record.action = RecoveryAction::Abort;
                let cause = format!(
                    "stage '{stage}' failed ({}) and its fallback failed: {fallback_failure}",
                    record.message
                );
                self.transition(state, |s| s.fail(Some(record), cause)).await
            }
        }
    }

    /// Applies `apply` to a copy of the state, persists it and adopts it.
    async fn transition<F>(&self, state: &mut WorkflowState, apply: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut WorkflowState) -> Result<(), StateError> + Send,
    {
        let mut next = state.clone();
        apply(&mut next).map_err(|e| EngineError::from_state(state.id, e))?;
        self.persist(&mut next).await?;
        *state = next;
        Ok(())
    }

    /// Writes the state with the next version, retrying while storage is unavailable.
    async fn persist(&self, state: &mut WorkflowState) -> Result<(), EngineError> {
        state.version += 1;
        let mut attempt = 0;
        loop {
            match self.persistence.save(state).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < self.config.persistence_max_attempts => {
                    let delay = self.config.persistence_backoff(attempt);
                    attempt += 1;
                    warn!(
                        workflow_id = %state.id,
                        version = state.version,
                        attempt,
                        error = %e,
                        "snapshot write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(EngineError::from_persistence(state.id, e)),
            }
        }
    }

    /// Best-effort write of a failed snapshot after persistence gave out.
    async fn fail_unpersisted(&self, state: &mut WorkflowState, reason: &str) {
        let mut failed = state.clone();
        if let Err(e) =
            failed.fail_storage(format!("workflow state could not be persisted: {reason}"))
        {
            warn!(error = %e, "workflow already finished, leaving snapshot as is");
            return;
        }
        failed.version += 1;
        match self.persistence.save(&failed).await {
            Ok(()) => *state = failed,
            Err(e) => error!(error = %e, "could not record persistence failure"),
        }
    }
}

impl<P, R> WorkflowEngine<P, R>
where
    P: StatePersistence + 'static,
    R: RecoveryPolicy + 'static,
{
    /// Resumes every running workflow left behind by a previous process.
    ///
    /// Each running instance is driven on its own task. Paused and pending
    /// instances are reported as skipped.
    #[instrument(skip_all)]
    pub async fn recover_active(self: &Arc<Self>) -> EngineResult<SweepReport> {
        let ids = self
            .persistence
            .list_active()
            .await
            .map_err(|e| EngineError::Storage {
                reason: e.to_string(),
            })?;

        let mut report = SweepReport::default();
        let mut handles = Vec::new();
        for id in ids {
            let state = match self.load(id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(workflow_id = %id, error = %e, "skipping unreadable workflow");
                    report.failed.push((id, e.to_string()));
                    continue;
                }
            };
            if state.status != WorkflowStatus::Running {
                debug!(workflow_id = %id, status = %state.status, "leaving workflow as is");
                report.skipped.push(id);
                continue;
            }
            let engine = Arc::clone(self);
            handles.push((id, tokio::spawn(async move { engine.drive_loaded(state).await })));
        }

        info!(resuming = handles.len(), skipped = report.skipped.len(), "recovery sweep started");
        let (ids, tasks): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (id, joined) in ids.into_iter().zip(join_all(tasks).await) {
            match joined {
                Ok(Ok(state)) => report.resumed.push(state.summary()),
                Ok(Err(e)) => report.failed.push((id, e.to_string())),
                Err(e) => report.failed.push((id, format!("drive task failed: {e}"))),
            }
        }
        info!(
            resumed = report.resumed.len(),
            failed = report.failed.len(),
            "recovery sweep finished"
        );
        Ok(report)
    }
}

fn no_fallback(stage: &str) -> StageFailure {
    StageFailure::Unrecoverable {
        message: format!("stage '{stage}' has no fallback"),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
