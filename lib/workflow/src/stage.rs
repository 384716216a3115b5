//! Stage processors and their registry.
//!
//! A stage processor is the pluggable business logic behind one named stage.
//! The engine only sees its contract: given a read-only view of the outputs
//! accumulated so far, return a JSON payload or a typed failure. Processors
//! must be idempotent under retry, since the engine re-invokes `execute`
//! with the same inputs after a transient failure.

use crate::state::StageOutput;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use stagehand_core::WorkflowId;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network, timeout or rate-limit style failures.
    Transient,
    /// Invalid input or unrecoverable data.
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// A typed failure returned by a stage processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageFailure {
    /// A remote dependency could not be reached.
    Network { message: String },
    /// The stage did not finish in time.
    Timeout { after_ms: u64 },
    /// A remote dependency asked us to slow down.
    RateLimited { retry_after_secs: Option<u64> },
    /// A remote dependency reported itself unavailable.
    ServiceUnavailable { service: String, message: String },
    /// The accumulated inputs are not usable by this stage.
    InvalidInput { message: String },
    /// The source data cannot be processed, whatever the retry.
    Unrecoverable { message: String },
}

impl StageFailure {
    /// Classifies the failure for the recovery policy.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::ServiceUnavailable { .. } => FailureClass::Transient,
            Self::InvalidInput { .. } | Self::Unrecoverable { .. } => FailureClass::Permanent,
        }
    }

    /// Short machine-readable code for the failure kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Unrecoverable { .. } => "unrecoverable",
        }
    }

    /// The minimum wait the failure itself asks for, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network { message } => write!(f, "network error: {message}"),
            Self::Timeout { after_ms } => write!(f, "stage timed out after {after_ms}ms"),
            Self::RateLimited { retry_after_secs } => match retry_after_secs {
                Some(secs) => write!(f, "rate limited, retry after {secs}s"),
                None => write!(f, "rate limited"),
            },
            Self::ServiceUnavailable { service, message } => {
                write!(f, "service '{service}' unavailable: {message}")
            }
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::Unrecoverable { message } => write!(f, "unrecoverable: {message}"),
        }
    }
}

impl std::error::Error for StageFailure {}

/// The read-only view handed to a stage processor.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    /// The workflow instance being driven.
    pub workflow_id: WorkflowId,
    /// The stage being executed.
    pub stage: &'a str,
    /// 1-based attempt number for this stage.
    pub attempt: u32,
    /// The initial context supplied at creation.
    pub context: &'a JsonValue,
    /// Outputs of every stage completed so far.
    pub outputs: &'a BTreeMap<String, StageOutput>,
}

impl<'a> StageInput<'a> {
    /// Returns the output recorded for an earlier stage.
    #[must_use]
    pub fn output(&self, stage: &str) -> Option<&'a StageOutput> {
        self.outputs.get(stage)
    }

    /// Returns the payload recorded for an earlier stage.
    #[must_use]
    pub fn payload(&self, stage: &str) -> Option<&'a JsonValue> {
        self.outputs.get(stage).map(|output| &output.payload)
    }
}

/// Trait for the pluggable unit of work behind one stage.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Runs the stage against the accumulated outputs.
    async fn execute(&self, input: &StageInput<'_>) -> Result<JsonValue, StageFailure>;

    /// Returns true if `fallback` can produce a degraded result.
    fn supports_fallback(&self) -> bool {
        false
    }

    /// Produces a deterministic degraded result without the primary path.
    ///
    /// The engine marks whatever this returns as degraded.
    async fn fallback(&self, input: &StageInput<'_>) -> Result<JsonValue, StageFailure> {
        Err(StageFailure::Unrecoverable {
            message: format!("stage '{}' has no fallback", input.stage),
        })
    }

    /// Schema version of the payloads this processor emits.
    fn output_schema_version(&self) -> u32 {
        1
    }
}

/// Where a degraded result for a stage comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackSource {
    /// The processor implements `fallback`.
    Processor,
    /// A static payload registered alongside the processor.
    Registered,
}

/// The set of processors a host makes available to its engine.
#[derive(Clone, Default)]
pub struct StageRegistry {
    processors: HashMap<String, Arc<dyn StageProcessor>>,
    default_fallbacks: HashMap<String, JsonValue>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the processor for a stage, replacing any earlier one.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>, processor: Arc<dyn StageProcessor>) -> Self {
        self.register(stage, processor);
        self
    }

    /// Registers a static degraded payload for a stage whose processor has no fallback.
    #[must_use]
    pub fn with_default_fallback(mut self, stage: impl Into<String>, payload: JsonValue) -> Self {
        self.default_fallbacks.insert(stage.into(), payload);
        self
    }

    /// Registers the processor for a stage, replacing any earlier one.
    pub fn register(&mut self, stage: impl Into<String>, processor: Arc<dyn StageProcessor>) {
        self.processors.insert(stage.into(), processor);
    }

    /// Returns the processor for a stage.
    #[must_use]
    pub fn get(&self, stage: &str) -> Option<&Arc<dyn StageProcessor>> {
        self.processors.get(stage)
    }

    /// Returns true if a processor is registered for the stage.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.processors.contains_key(stage)
    }

    /// Returns the first stage in `stages` without a processor.
    #[must_use]
    pub fn first_missing<'a>(&self, stages: impl IntoIterator<Item = &'a String>) -> Option<&'a str> {
        stages
            .into_iter()
            .find(|stage| !self.contains(stage))
            .map(String::as_str)
    }

    /// Returns how a degraded result would be produced for the stage, if at all.
    #[must_use]
    pub fn fallback_source(&self, stage: &str) -> Option<FallbackSource> {
        if self
            .processors
            .get(stage)
            .is_some_and(|processor| processor.supports_fallback())
        {
            Some(FallbackSource::Processor)
        } else if self.default_fallbacks.contains_key(stage) {
            Some(FallbackSource::Registered)
        } else {
            None
        }
    }

    /// Returns the registered static fallback for a stage.
    #[must_use]
    pub fn default_fallback(&self, stage: &str) -> Option<&JsonValue> {
        self.default_fallbacks.get(stage)
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages: Vec<&String> = self.processors.keys().collect();
        stages.sort();
        let mut fallbacks: Vec<&String> = self.default_fallbacks.keys().collect();
        fallbacks.sort();
        f.debug_struct("StageRegistry")
            .field("stages", &stages)
            .field("default_fallbacks", &fallbacks)
            .finish()
    }
}
