//! Typed identifiers.
//!
//! Ids wrap a ULID and render as `<prefix>_<ulid>`, e.g. `wf_01J9...`. The
//! prefixed form is what the stores use for file names and what log lines
//! carry, so parsing insists on the prefix: a `drv_` string never parses as
//! a `WorkflowId`. ULIDs sort by creation time, and so do the ids.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when a string is not a valid id of the expected kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The id type that was being parsed.
    pub id_type: &'static str,
    /// What was wrong with the input.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Prefix used in the rendered form.
            pub const PREFIX: &'static str = $prefix;

            /// Mints a fresh id.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Milliseconds since the Unix epoch at which the id was minted.
            #[must_use]
            pub fn minted_at_ms(&self) -> u64 {
                self.0.timestamp_ms()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let err = |reason: String| ParseIdError {
                    id_type: stringify!($name),
                    reason,
                };
                let body = s
                    .strip_prefix(concat!($prefix, "_"))
                    .ok_or_else(|| err(format!("expected prefix '{}_' in '{s}'", $prefix)))?;
                Ulid::from_str(body)
                    .map(Self)
                    .map_err(|e| err(e.to_string()))
            }
        }
    };
}

prefixed_id!(
    /// One workflow instance (one migration).
    WorkflowId,
    "wf"
);

prefixed_id!(
    /// One drive loop over a workflow instance.
    ///
    /// Minted each time the engine claims an instance, so two drives of the
    /// same workflow can be told apart in logs and in the control registry.
    DriveId,
    "drv"
);
