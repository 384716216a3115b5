//! End-to-end runs of the engine through its public API.

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use stagehand_core::WorkflowId;
use stagehand_workflow::{
    ControlOutcome, EngineConfig, EngineError, InMemoryStatePersistence, PersistenceError,
    RecoveryAction, StageFailure, StageInput, StageProcessor, StageRegistry, StatePersistence,
    WorkflowEngine, WorkflowState, WorkflowStatus,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Processor that fails with the scripted failures first, then succeeds.
#[derive(Default)]
struct Scripted {
    failures: Mutex<VecDeque<StageFailure>>,
    fallback: Option<JsonValue>,
    calls: AtomicU32,
}

impl Scripted {
    fn ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing(failures: impl IntoIterator<Item = StageFailure>) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(failures.into_iter().collect()),
            ..Self::default()
        })
    }

    fn with_fallback(failures: impl IntoIterator<Item = StageFailure>, fallback: JsonValue) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(failures.into_iter().collect()),
            fallback: Some(fallback),
            ..Self::default()
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageProcessor for Scripted {
    async fn execute(&self, input: &StageInput<'_>) -> Result<JsonValue, StageFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        let upstream: Vec<&String> = input.outputs.keys().collect();
        Ok(json!({ "stage": input.stage, "saw": upstream }))
    }

    fn supports_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    async fn fallback(&self, _input: &StageInput<'_>) -> Result<JsonValue, StageFailure> {
        Ok(self.fallback.clone().unwrap_or(JsonValue::Null))
    }
}

/// Processor that blocks inside `execute` until released.
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
    calls: AtomicU32,
}

#[async_trait]
impl StageProcessor for Gate {
    async fn execute(&self, input: &StageInput<'_>) -> Result<JsonValue, StageFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(json!({ "stage": input.stage }))
    }
}

/// Store that remembers the status and progress of every accepted write.
#[derive(Default)]
struct RecordingStore {
    inner: InMemoryStatePersistence,
    writes: Mutex<Vec<(WorkflowStatus, u8)>>,
}

#[async_trait]
impl StatePersistence for RecordingStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), PersistenceError> {
        self.inner.save(state).await?;
        self.writes
            .lock()
            .unwrap()
            .push((state.status, state.progress_percentage));
        Ok(())
    }

    async fn load(&self, id: WorkflowId) -> Result<WorkflowState, PersistenceError> {
        self.inner.load(id).await
    }

    async fn list_active(&self) -> Result<Vec<WorkflowId>, PersistenceError> {
        self.inner.list_active().await
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        retry_base_delay_ms: 0,
        persistence_base_delay_ms: 0,
        ..EngineConfig::default()
    }
}

fn sequence() -> Vec<String> {
    ["analyze", "plan", "notify"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn network() -> StageFailure {
    StageFailure::Network {
        message: "upstream reset the connection".to_string(),
    }
}

type Engine = WorkflowEngine<Arc<InMemoryStatePersistence>>;

fn engine(store: &Arc<InMemoryStatePersistence>, registry: StageRegistry) -> Arc<Engine> {
    Arc::new(WorkflowEngine::new(Arc::clone(store), registry, config()))
}

#[tokio::test]
async fn all_stages_succeed() {
    let store = Arc::new(InMemoryStatePersistence::new());
    let engine = engine(
        &store,
        StageRegistry::new()
            .with_stage("analyze", Scripted::ok())
            .with_stage("plan", Scripted::ok())
            .with_stage("notify", Scripted::ok()),
    );
    let id = engine
        .create(sequence(), json!({ "source_platform": "shopify" }))
        .await
        .unwrap();

    let state = engine.run(id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.progress_percentage, 100);
    assert_eq!(state.completed_stages, sequence());
    assert_eq!(state.current_stage_index, 3);
    assert_eq!(
        state.stage_outputs["notify"].payload["saw"],
        json!(["analyze", "plan"])
    );
    assert_eq!(store.load(id).await.unwrap(), state);
}

#[tokio::test]
async fn transient_plan_failures_are_retried() {
    let store = Arc::new(InMemoryStatePersistence::new());
    let plan = Scripted::failing([network(), network()]);
    let engine = engine(
        &store,
        StageRegistry::new()
            .with_stage("analyze", Scripted::ok())
            .with_stage("plan", plan.clone())
            .with_stage("notify", Scripted::ok()),
    );
    let id = engine.create(sequence(), json!({})).await.unwrap();

    let state = engine.run(id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.retry_count("plan"), 2);
    assert_eq!(plan.calls(), 3);
    assert_eq!(state.errors.len(), 2);
    for (i, record) in state.errors.iter().enumerate() {
        assert_eq!(record.stage, "plan");
        assert_eq!(record.attempt, i as u32 + 1);
        assert_eq!(record.action, RecoveryAction::Retry);
    }
    assert!(state.summary().ready_for_execution);
}

#[tokio::test]
async fn permanent_notify_failure_fails_the_workflow() {
    let store = Arc::new(InMemoryStatePersistence::new());
    let notify = Scripted::failing([StageFailure::InvalidInput {
        message: "no customer contact list".to_string(),
    }]);
    let engine = engine(
        &store,
        StageRegistry::new()
            .with_stage("analyze", Scripted::ok())
            .with_stage("plan", Scripted::ok())
            .with_stage("notify", notify.clone()),
    );
    let id = engine.create(sequence(), json!({})).await.unwrap();

    let state = engine.run(id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.current_stage_index, 2);
    assert_eq!(state.completed_stages, ["analyze", "plan"]);
    assert!(!state.stage_outputs.contains_key("notify"));
    assert_eq!(notify.calls(), 1);
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].action, RecoveryAction::Abort);

    let report = engine.status(id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.current_stage.as_deref(), Some("notify"));
}

#[tokio::test]
async fn pause_between_stages_then_resume() {
    let store = Arc::new(InMemoryStatePersistence::new());
    let analyze = Arc::new(Gate::default());
    let plan = Scripted::ok();
    let engine = engine(
        &store,
        StageRegistry::new()
            .with_stage("analyze", analyze.clone())
            .with_stage("plan", plan.clone())
            .with_stage("notify", Scripted::ok()),
    );
    let id = engine.create(sequence(), json!({})).await.unwrap();

    let driver = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(id).await }
    });
    analyze.entered.notified().await;

    assert_eq!(engine.pause(id).await.unwrap(), ControlOutcome::Requested);
    analyze.release.notify_one();

    let paused = driver.await.unwrap().unwrap();
    assert_eq!(paused.status, WorkflowStatus::Paused);
    assert_eq!(paused.current_stage_index, 1);
    assert_eq!(paused.current_stage(), Some("plan"));
    assert_eq!(plan.calls(), 0);
    assert!(!engine.control().is_driving(id));

    let resumed = engine.resume(id).await.unwrap();
    assert_eq!(resumed.status, WorkflowStatus::Running);

    let done = engine.run(id).await.unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(analyze.calls.load(Ordering::SeqCst), 1);
    assert_eq!(plan.calls(), 1);
}

#[tokio::test]
async fn run_on_paused_instance_skips_completed_stages() {
    let store = Arc::new(InMemoryStatePersistence::new());
    let analyze = Arc::new(Gate::default());
    let engine = engine(
        &store,
        StageRegistry::new()
            .with_stage("analyze", analyze.clone())
            .with_stage("plan", Scripted::ok())
            .with_stage("notify", Scripted::ok()),
    );
    let id = engine.create(sequence(), json!({})).await.unwrap();

    let driver = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(id).await }
    });
    analyze.entered.notified().await;
    engine.pause(id).await.unwrap();
    analyze.release.notify_one();
    driver.await.unwrap().unwrap();

    let done = engine.run(id).await.unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(analyze.calls.load(Ordering::SeqCst), 1);

    // Running again is a no-op on the finished instance.
    let again = engine.run(id).await.unwrap();
    assert_eq!(again, done);
}

#[tokio::test]
async fn cancel_while_driving_stops_at_boundary() {
    let store = Arc::new(InMemoryStatePersistence::new());
    let analyze = Arc::new(Gate::default());
    let plan = Scripted::ok();
    let engine = engine(
        &store,
        StageRegistry::new()
            .with_stage("analyze", analyze.clone())
            .with_stage("plan", plan.clone())
            .with_stage("notify", Scripted::ok()),
    );
    let id = engine.create(sequence(), json!({})).await.unwrap();

    let driver = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(id).await }
    });
    analyze.entered.notified().await;
    assert_eq!(engine.pause(id).await.unwrap(), ControlOutcome::Requested);
    assert_eq!(engine.cancel(id).await.unwrap(), ControlOutcome::Requested);
    analyze.release.notify_one();

    let cancelled = driver.await.unwrap().unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
    assert_eq!(cancelled.completed_stages, ["analyze"]);
    assert_eq!(plan.calls(), 0);
}

#[tokio::test]
async fn pause_during_last_stage_lets_the_workflow_complete() {
    let store = Arc::new(InMemoryStatePersistence::new());
    let notify = Arc::new(Gate::default());
    let engine = engine(
        &store,
        StageRegistry::new()
            .with_stage("analyze", Scripted::ok())
            .with_stage("plan", Scripted::ok())
            .with_stage("notify", notify.clone()),
    );
    let id = engine.create(sequence(), json!({})).await.unwrap();

    let driver = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(id).await }
    });
    notify.entered.notified().await;
    assert_eq!(engine.pause(id).await.unwrap(), ControlOutcome::Requested);
    notify.release.notify_one();

    let done = driver.await.unwrap().unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert!(!engine.control().is_driving(id));
    assert_eq!(store.load(id).await.unwrap(), done);

    let err = engine.pause(id).await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        EngineError::InvalidTransition { .. }
    ));
}

#[tokio::test]
async fn concurrent_runs_on_one_engine_conflict() {
    let store = Arc::new(InMemoryStatePersistence::new());
    let analyze = Arc::new(Gate::default());
    let engine = engine(
        &store,
        StageRegistry::new()
            .with_stage("analyze", analyze.clone())
            .with_stage("plan", Scripted::ok())
            .with_stage("notify", Scripted::ok()),
    );
    let id = engine.create(sequence(), json!({})).await.unwrap();

    let driver = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(id).await }
    });
    analyze.entered.notified().await;

    let err = engine.run(id).await.unwrap_err();
    assert!(matches!(err.current_context(), EngineError::Conflict { .. }));

    analyze.release.notify_one();
    let state = driver.await.unwrap().unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(analyze.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn racing_engines_leave_one_winner() {
    let store = Arc::new(InMemoryStatePersistence::new());
    let slow_analyze = Arc::new(Gate::default());
    let slow = engine(
        &store,
        StageRegistry::new()
            .with_stage("analyze", slow_analyze.clone())
            .with_stage("plan", Scripted::ok())
            .with_stage("notify", Scripted::ok()),
    );
    let fast = engine(
        &store,
        StageRegistry::new()
            .with_stage("analyze", Scripted::ok())
            .with_stage("plan", Scripted::ok())
            .with_stage("notify", Scripted::ok()),
    );
    let id = slow.create(sequence(), json!({})).await.unwrap();

    let slow_driver = tokio::spawn({
        let slow = Arc::clone(&slow);
        async move { slow.run(id).await }
    });
    slow_analyze.entered.notified().await;

    let winner = fast.run(id).await.unwrap();
    assert_eq!(winner.status, WorkflowStatus::Completed);

    slow_analyze.release.notify_one();
    let err = slow_driver.await.unwrap().unwrap_err();
    assert!(matches!(err.current_context(), EngineError::Conflict { .. }));

    let stored = store.load(id).await.unwrap();
    assert_eq!(stored, winner);
}

#[tokio::test]
async fn retry_cap_then_degrade() {
    let store = Arc::new(InMemoryStatePersistence::new());
    let seo = Scripted::with_fallback(
        std::iter::repeat_with(network).take(10),
        json!({ "redirects": "estimated" }),
    );
    let engine = engine(
        &store,
        StageRegistry::new()
            .with_stage("analyze", Scripted::ok())
            .with_stage("plan", seo.clone())
            .with_stage("notify", Scripted::ok()),
    );
    let id = engine.create(sequence(), json!({})).await.unwrap();

    let state = engine.run(id).await.unwrap();

    let max_attempts = engine.config().max_attempts;
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(seo.calls(), max_attempts + 1);
    assert_eq!(state.retry_count("plan"), max_attempts);
    assert!(state.stage_outputs["plan"].degraded);
    assert_eq!(state.degraded_stages(), ["plan"]);
    let last = state.errors.last().unwrap();
    assert_eq!(last.action, RecoveryAction::Degrade);
    assert!(!state.summary().ready_for_execution);
}

#[tokio::test]
async fn terminal_instances_are_immutable() {
    let store = Arc::new(InMemoryStatePersistence::new());
    let engine = engine(
        &store,
        StageRegistry::new()
            .with_stage("analyze", Scripted::ok())
            .with_stage("plan", Scripted::ok())
            .with_stage("notify", Scripted::ok()),
    );
    let id = engine.create(sequence(), json!({})).await.unwrap();
    let done = engine.run(id).await.unwrap();

    assert!(engine.pause(id).await.is_err());
    assert!(engine.resume(id).await.is_err());
    let err = engine.cancel(id).await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        EngineError::InvalidTransition {
            from: WorkflowStatus::Completed,
            ..
        }
    ));
    assert_eq!(engine.run(id).await.unwrap(), done);
    assert_eq!(engine.drive(done.clone()).await.unwrap(), done);
    assert_eq!(store.load(id).await.unwrap(), done);
}

#[tokio::test]
async fn progress_never_decreases() {
    let store = Arc::new(RecordingStore::default());
    let engine = WorkflowEngine::new(
        Arc::clone(&store),
        StageRegistry::new()
            .with_stage("analyze", Scripted::ok())
            .with_stage("plan", Scripted::failing([network()]))
            .with_stage("notify", Scripted::ok()),
        config(),
    );
    let id = engine.create(sequence(), json!({})).await.unwrap();
    engine.run(id).await.unwrap();

    let writes = store.writes.lock().unwrap().clone();
    assert!(writes.len() >= 5);
    for pair in writes.windows(2) {
        assert!(pair[0].1 <= pair[1].1, "progress went backwards: {writes:?}");
    }
    for (status, progress) in &writes {
        assert_eq!(*progress == 100, *status == WorkflowStatus::Completed);
    }
}

#[tokio::test]
async fn recovery_sweep_resumes_running_instances() {
    let store = Arc::new(InMemoryStatePersistence::new());
    let registry = StageRegistry::new()
        .with_stage("analyze", Scripted::ok())
        .with_stage("plan", Scripted::ok())
        .with_stage("notify", Scripted::ok());
    let engine = engine(&store, registry);

    // A driver that died after starting.
    let interrupted = engine.create(sequence(), json!({})).await.unwrap();
    let mut state = store.load(interrupted).await.unwrap();
    state.start().unwrap();
    state.version += 1;
    store.save(&state).await.unwrap();

    let pending = engine.create(sequence(), json!({})).await.unwrap();

    let report = engine.recover_active().await.unwrap();
    assert_eq!(report.resumed.len(), 1);
    assert_eq!(report.resumed[0].workflow_id, interrupted);
    assert_eq!(report.resumed[0].status, WorkflowStatus::Completed);
    assert_eq!(report.skipped, vec![pending]);
    assert!(report.failed.is_empty());

    assert_eq!(store.list_active().await.unwrap(), vec![pending]);
}
