//! Core domain types and utilities for the stagehand workflow engine.
//!
//! This crate provides the foundational types and error handling shared by
//! the engine library and the worker binary.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{DriveId, ParseIdError, WorkflowId};
