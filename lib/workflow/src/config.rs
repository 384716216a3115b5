//! Engine configuration.
//!
//! Every field has a default so a host can deserialize a partial config
//! (or none at all) from its own configuration source.

use serde::Deserialize;
use std::time::Duration;

/// Tunables for the drive loop, retries and persistence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Retry cap for transient stage failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base of the exponential retry delay, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound on a single retry delay, in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Watchdog timeout for one stage invocation, in seconds.
    /// A stage that overruns it is treated as a transient failure.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// Attempts per snapshot write before the drive is failed.
    #[serde(default = "default_persistence_max_attempts")]
    pub persistence_max_attempts: u32,

    /// Base of the persistence backoff, in milliseconds.
    #[serde(default = "default_persistence_base_delay_ms")]
    pub persistence_base_delay_ms: u64,

    /// Optional error budget per instance; once exceeded every failure aborts.
    #[serde(default)]
    pub max_total_errors: Option<usize>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_stage_timeout_secs() -> u64 {
    300
}

fn default_persistence_max_attempts() -> u32 {
    5
}

fn default_persistence_base_delay_ms() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            stage_timeout_secs: default_stage_timeout_secs(),
            persistence_max_attempts: default_persistence_max_attempts(),
            persistence_base_delay_ms: default_persistence_base_delay_ms(),
            max_total_errors: None,
        }
    }
}

impl EngineConfig {
    /// Watchdog timeout for one stage invocation.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Delay before persistence attempt `attempt + 1` (0-based `attempt`).
    #[must_use]
    pub fn persistence_backoff(&self, attempt: u32) -> Duration {
        exponential_delay(
            Duration::from_millis(self.persistence_base_delay_ms),
            attempt,
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

/// `min(base * 2^attempt, cap)`, saturating instead of overflowing.
#[must_use]
pub fn exponential_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(cap)
}
