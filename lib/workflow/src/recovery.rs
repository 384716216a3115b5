//! Failure classification and routing.
//!
//! A recovery policy is a pure decision function: given the failing stage,
//! the failure, how many retries have already been spent and whether a
//! fallback exists, it answers retry, degrade or abort. Keeping it free of
//! engine state makes it testable on its own.

use crate::config::{EngineConfig, exponential_delay};
use crate::stage::{FailureClass, StageFailure};
use crate::state::RecoveryAction;
use std::time::Duration;

/// Everything a policy may look at when deciding.
#[derive(Debug, Clone, Copy)]
pub struct FailureContext<'a> {
    /// The failing stage.
    pub stage: &'a str,
    /// What the processor (or the watchdog) reported.
    pub failure: &'a StageFailure,
    /// Retries already spent on this stage.
    pub retries_so_far: u32,
    /// Whether a degraded output can be produced for this stage.
    pub fallback_available: bool,
    /// Size of the instance's error history before this failure.
    pub total_errors: usize,
}

/// The policy's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Invoke the same stage again after `delay`.
    Retry { delay: Duration },
    /// Record a fallback output and move on.
    Degrade,
    /// Fail the workflow.
    Abort,
}

impl RecoveryDecision {
    /// The action recorded in the error history for this decision.
    #[must_use]
    pub fn action(&self) -> RecoveryAction {
        match self {
            Self::Retry { .. } => RecoveryAction::Retry,
            Self::Degrade => RecoveryAction::Degrade,
            Self::Abort => RecoveryAction::Abort,
        }
    }
}

/// Trait for deciding what to do about a stage failure.
pub trait RecoveryPolicy: Send + Sync {
    /// Decides how to handle one failure.
    fn decide(&self, failure: &FailureContext<'_>) -> RecoveryDecision;
}

/// Retry transient failures with capped exponential backoff, then degrade or abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRecoveryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_total_errors: Option<usize>,
}

impl DefaultRecoveryPolicy {
    /// Creates a policy with an explicit retry cap and backoff.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            max_total_errors: None,
        }
    }

    /// Creates a policy from the engine configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            max_total_errors: config.max_total_errors,
        }
    }

    /// Aborts every failure once an instance has more than `budget` errors.
    #[must_use]
    pub fn with_error_budget(mut self, budget: usize) -> Self {
        self.max_total_errors = Some(budget);
        self
    }

    /// Delay before retry number `retries_so_far + 1`.
    #[must_use]
    pub fn backoff(&self, retries_so_far: u32) -> Duration {
        exponential_delay(self.base_delay, retries_so_far, self.max_delay)
    }

    fn give_up(&self, failure: &FailureContext<'_>) -> RecoveryDecision {
        if failure.fallback_available {
            RecoveryDecision::Degrade
        } else {
            RecoveryDecision::Abort
        }
    }
}

impl Default for DefaultRecoveryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RecoveryPolicy for DefaultRecoveryPolicy {
    fn decide(&self, failure: &FailureContext<'_>) -> RecoveryDecision {
        if self
            .max_total_errors
            .is_some_and(|budget| failure.total_errors + 1 > budget)
        {
            return RecoveryDecision::Abort;
        }

        match failure.failure.class() {
            FailureClass::Transient if failure.retries_so_far < self.max_attempts => {
                let backoff = self.backoff(failure.retries_so_far);
                let delay = failure
                    .failure
                    .retry_after()
                    .map_or(backoff, |requested| requested.max(backoff));
                RecoveryDecision::Retry { delay }
            }
            FailureClass::Transient | FailureClass::Permanent => self.give_up(failure),
        }
    }
}
