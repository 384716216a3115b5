//! Worker configuration.
//!
//! Loaded via the `config` crate from `STAGEHAND_*` environment variables,
//! with `__` separating nested keys, e.g. `STAGEHAND_ENGINE__MAX_ATTEMPTS=5`
//! or `STAGEHAND_MIGRATION__SOURCE_PLATFORM=shopify`.

use serde::Deserialize;
use serde_json::{Map, Value as JsonValue, json};
use stagehand_workflow::EngineConfig;
use std::path::PathBuf;

const ENV_PREFIX: &str = "STAGEHAND";

/// Worker configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// Directory holding one snapshot file per workflow.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Engine tunables.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Migration to submit at startup, if any.
    #[serde(default)]
    pub migration: Option<MigrationRequest>,
}

/// A migration to plan between two storefront platforms.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MigrationRequest {
    pub source_platform: String,
    pub destination_platform: String,
    /// Free-form options passed through to the stages.
    #[serde(default)]
    pub options: Map<String, JsonValue>,
}

impl MigrationRequest {
    /// The initial workflow context for this request.
    #[must_use]
    pub fn context(&self) -> JsonValue {
        json!({
            "source_platform": self.source_platform,
            "destination_platform": self.destination_platform,
            "options": self.options,
        })
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state/workflows")
}

impl WorkerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration values are present but invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(environment())
    }

    fn from_source(source: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
