//! Shared result type for stagehand crates.
//!
//! Domain errors live next to the code that raises them (the engine's
//! `EngineError`, the stores' `PersistenceError`). Public operations wrap
//! them in a `rootcause::Report` so callers get the typed context plus any
//! attachments added on the way up.

use rootcause::Report;

/// A `Result` whose error is a `rootcause::Report` carrying context `C`.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
