//! Versioned envelope for persisted workflow snapshots.
//!
//! Every snapshot a `StatePersistence` backend writes is wrapped as
//! `{"schema_version": N, "payload": {...}}`. Readers look at the version
//! before touching the payload, so a build can refuse snapshots written by a
//! newer schema instead of silently misreading them, and can upgrade older
//! ones in place.

use crate::error::PersistenceError;
use crate::state::WorkflowState;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The snapshot schema this build writes.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// A snapshot wrapped with its schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEnvelope<T> {
    /// Schema version of the payload.
    pub schema_version: u32,
    /// The wrapped snapshot.
    pub payload: T,
}

impl<T> SnapshotEnvelope<T> {
    /// Wraps a payload with the current schema version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            payload,
        }
    }
}

/// An envelope whose payload has not been deserialized yet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct RawEnvelope {
    schema_version: u32,
    payload: JsonValue,
}

/// Serializes a workflow state into envelope bytes.
///
/// # Errors
///
/// Returns `PersistenceError::Corrupt` if the state cannot be serialized.
pub fn encode_snapshot(state: &WorkflowState) -> Result<Vec<u8>, PersistenceError> {
    serde_json::to_vec(&SnapshotEnvelope::new(state)).map_err(|e| PersistenceError::Corrupt {
        reason: format!("failed to serialize {}: {e}", state.id),
    })
}

/// Deserializes envelope bytes into a validated workflow state.
///
/// Snapshots without an envelope are treated as schema version 0.
///
/// # Errors
///
/// Returns `UnsupportedSchema` for snapshots from a newer schema and
/// `Corrupt` for anything that does not decode into a valid state.
pub fn decode_snapshot(bytes: &[u8]) -> Result<WorkflowState, PersistenceError> {
    let value: JsonValue = serde_json::from_slice(bytes).map_err(|e| PersistenceError::Corrupt {
        reason: format!("snapshot is not valid JSON: {e}"),
    })?;

    let raw = if value.get("schema_version").is_some() {
        serde_json::from_value::<RawEnvelope>(value).map_err(|e| PersistenceError::Corrupt {
            reason: format!("malformed snapshot envelope: {e}"),
        })?
    } else {
        RawEnvelope {
            schema_version: 0,
            payload: value,
        }
    };

    if raw.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(PersistenceError::UnsupportedSchema {
            found: raw.schema_version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    let payload = upgrade(raw.schema_version, raw.payload);
    let state: WorkflowState =
        serde_json::from_value(payload).map_err(|e| PersistenceError::Corrupt {
            reason: format!("malformed workflow state: {e}"),
        })?;
    state.validate().map_err(|e| PersistenceError::Corrupt {
        reason: e.to_string(),
    })?;
    Ok(state)
}

/// Brings a payload written by `from_version` up to the current schema.
fn upgrade(from_version: u32, mut payload: JsonValue) -> JsonValue {
    if from_version == 0 {
        // Bare snapshots predate the retry counter map.
        if let Some(object) = payload.as_object_mut() {
            object
                .entry("retry_counts")
                .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
        }
    }
    payload
}
