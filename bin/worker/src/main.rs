//! Stagehand worker.
//!
//! Owns one workflow engine for the lifetime of the process: on startup it
//! resumes workflows a previous process left running, then optionally
//! submits the configured migration and drives it. Ctrl-C pauses the
//! migration at the next stage boundary so a later start can pick it up.

mod config;
mod stages;

use config::WorkerConfig;
use stagehand_core::WorkflowId;
use stagehand_workflow::{
    EngineError, FileStatePersistence, RecoveryPolicy, StatePersistence, WorkflowEngine,
    WorkflowState, WorkflowStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often a shutdown pause is retried while the drive is still starting.
const PAUSE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env().expect("failed to load configuration");
    tracing::info!(state_dir = %config.state_dir.display(), "Loaded configuration");

    let store = FileStatePersistence::open(&config.state_dir)
        .await
        .expect("failed to open state directory");
    let engine = Arc::new(WorkflowEngine::new(
        store,
        stages::registry(),
        config.engine.clone(),
    ));

    // Resume whatever a previous process left running
    match engine.recover_active().await {
        Ok(report) => {
            for summary in &report.resumed {
                tracing::info!(
                    workflow_id = %summary.workflow_id,
                    status = %summary.status,
                    ready_for_execution = summary.ready_for_execution,
                    "Recovered workflow"
                );
            }
            for (workflow_id, error) in &report.failed {
                tracing::warn!(%workflow_id, %error, "Failed to recover workflow");
            }
            if !report.skipped.is_empty() {
                tracing::info!(count = report.skipped.len(), "Left paused or pending workflows alone");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Recovery sweep failed"),
    }

    let Some(migration) = config.migration else {
        tracing::info!("No migration configured, exiting");
        return;
    };

    let id = match engine
        .create(stages::migration_sequence(), migration.context())
        .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create migration workflow");
            return;
        }
    };
    tracing::info!(
        workflow_id = %id,
        source = %migration.source_platform,
        destination = %migration.destination_platform,
        "Submitted migration"
    );

    let mut driver = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(id).await }
    });

    let finished = tokio::select! {
        joined = &mut driver => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(workflow_id = %id, "Shutdown requested, pausing at next stage boundary");
            tokio::select! {
                joined = &mut driver => joined,
                paused = pause_when_running(&engine, id) => {
                    if !paused {
                        // Still running in storage; the next start's recovery sweep resumes it.
                        tracing::warn!(workflow_id = %id, "Could not pause migration, stopping the drive");
                        driver.abort();
                    }
                    driver.await
                }
            }
        }
    };

    match finished {
        Ok(Ok(state)) => report_outcome(&state),
        Ok(Err(e)) => tracing::error!(workflow_id = %id, error = %e, "Migration drive failed"),
        Err(e) if e.is_cancelled() => {
            tracing::info!(workflow_id = %id, "Migration drive stopped, it resumes on next start");
        }
        Err(e) => tracing::error!(workflow_id = %id, error = %e, "Migration task panicked"),
    }
}

/// Requests a pause, waiting for a drive that has not persisted `running` yet.
///
/// Returns false if the workflow cannot be paused at all.
async fn pause_when_running<P, R>(engine: &WorkflowEngine<P, R>, id: WorkflowId) -> bool
where
    P: StatePersistence,
    R: RecoveryPolicy,
{
    loop {
        match engine.pause(id).await {
            Ok(_) => return true,
            Err(e)
                if matches!(
                    e.current_context(),
                    EngineError::InvalidTransition {
                        from: WorkflowStatus::Pending,
                        ..
                    }
                ) =>
            {
                tracing::debug!(workflow_id = %id, "Migration not started yet, retrying pause");
                tokio::time::sleep(PAUSE_RETRY_INTERVAL).await;
            }
            Err(e) => {
                tracing::warn!(workflow_id = %id, error = %e, "Failed to pause migration");
                return false;
            }
        }
    }
}

fn report_outcome(state: &WorkflowState) {
    let summary = state.summary();
    match state.status {
        WorkflowStatus::Completed => tracing::info!(
            workflow_id = %summary.workflow_id,
            stages = summary.stages_completed.len(),
            degraded = ?summary.degraded_stages,
            total_errors = summary.total_errors,
            ready_for_execution = summary.ready_for_execution,
            "Migration planning completed"
        ),
        WorkflowStatus::Paused => tracing::info!(
            workflow_id = %summary.workflow_id,
            next_stage = state.current_stage().unwrap_or_default(),
            "Migration paused"
        ),
        _ => tracing::warn!(
            workflow_id = %summary.workflow_id,
            status = %summary.status,
            failure = summary.failure.as_deref().unwrap_or_default(),
            "Migration did not complete"
        ),
    }
}
