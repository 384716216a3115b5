//! In-process bookkeeping of active drives.
//!
//! Each engine keeps a registry of the workflows it is currently driving.
//! Claiming an id returns a guard that releases it on drop, so at most one
//! drive loop per engine holds a given workflow. Pause and cancel requests
//! for a driven workflow are parked here and picked up by the drive loop at
//! the next stage boundary. Across engines, the persistence version check
//! is what keeps drivers exclusive.

use stagehand_core::{DriveId, WorkflowId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A control request waiting for the next stage boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Stop after the in-flight stage, resumable.
    Pause,
    /// Stop after the in-flight stage, terminal.
    Cancel,
}

#[derive(Debug)]
struct ActiveDrive {
    drive_id: DriveId,
    request: Option<ControlRequest>,
}

/// The set of workflows being driven by one engine.
#[derive(Debug, Clone, Default)]
pub struct ControlRegistry {
    active: Arc<Mutex<HashMap<WorkflowId, ActiveDrive>>>,
}

impl ControlRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<WorkflowId, ActiveDrive>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims a workflow for driving.
    ///
    /// Returns `None` if the workflow is already being driven.
    #[must_use]
    pub fn claim(&self, workflow_id: WorkflowId) -> Option<DriveGuard> {
        let mut active = self.active();
        if active.contains_key(&workflow_id) {
            return None;
        }
        let drive_id = DriveId::new();
        active.insert(
            workflow_id,
            ActiveDrive {
                drive_id,
                request: None,
            },
        );
        Some(DriveGuard {
            registry: self.clone(),
            workflow_id,
            drive_id,
        })
    }

    /// Returns true if the workflow is being driven.
    #[must_use]
    pub fn is_driving(&self, workflow_id: WorkflowId) -> bool {
        self.active().contains_key(&workflow_id)
    }

    /// Parks a request for the drive loop.
    ///
    /// Returns false if the workflow is not being driven. A cancel replaces
    /// an earlier pause; a pause never replaces a cancel.
    pub fn request(&self, workflow_id: WorkflowId, request: ControlRequest) -> bool {
        let mut active = self.active();
        let Some(drive) = active.get_mut(&workflow_id) else {
            return false;
        };
        if drive.request != Some(ControlRequest::Cancel) {
            drive.request = Some(request);
        }
        true
    }

    /// Number of workflows being driven.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active().len()
    }

    /// Returns true if nothing is being driven.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active().is_empty()
    }
}

/// Exclusive claim on a workflow, released on drop.
#[derive(Debug)]
pub struct DriveGuard {
    registry: ControlRegistry,
    workflow_id: WorkflowId,
    drive_id: DriveId,
}

impl DriveGuard {
    /// Identifier of this drive, for log correlation.
    #[must_use]
    pub fn drive_id(&self) -> DriveId {
        self.drive_id
    }

    /// Takes the parked request, if any.
    pub fn take_request(&self) -> Option<ControlRequest> {
        self.registry
            .active()
            .get_mut(&self.workflow_id)
            .and_then(|drive| drive.request.take())
    }
}

impl Drop for DriveGuard {
    fn drop(&mut self) {
        let mut active = self.registry.active();
        if active
            .get(&self.workflow_id)
            .is_some_and(|drive| drive.drive_id == self.drive_id)
        {
            active.remove(&self.workflow_id);
        }
    }
}
