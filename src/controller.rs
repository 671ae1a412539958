//! Orchestration controller abstraction.
//!
//! Submission is the sole point where physical provisioning is triggered.
//! A returned `Ok(())` means the controller accepted the batch; provisioning
//! continues asynchronously and is tracked through the task collaborator.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;

use crate::descriptor::VolumeDescriptor;
use crate::model::{TaskId, VolumeId};

/// Future returned by controller operations.
pub type ControllerFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Interface implemented by orchestration controllers.
pub trait OrchestrationController {
    /// Controller specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Submits a creation batch.
    fn create_volumes<'a>(
        &'a self,
        descriptors: &'a [VolumeDescriptor],
        task: &'a TaskId,
    ) -> ControllerFuture<'a, (), Self::Error>;

    /// Submits an expansion batch growing the replication set to `new_size`.
    fn expand_volume<'a>(
        &'a self,
        descriptors: &'a [VolumeDescriptor],
        new_size: u64,
        task: &'a TaskId,
    ) -> ControllerFuture<'a, (), Self::Error>;

    /// Submits a deletion batch.
    fn delete_volumes<'a>(
        &'a self,
        descriptors: &'a [VolumeDescriptor],
        task: &'a TaskId,
    ) -> ControllerFuture<'a, (), Self::Error>;

    /// Submits a tier change batch (protection change or data migration).
    fn change_virtual_pool<'a>(
        &'a self,
        descriptors: &'a [VolumeDescriptor],
        task: &'a TaskId,
    ) -> ControllerFuture<'a, (), Self::Error>;

    /// Reports the capacity the array currently allocates for `volume`, or
    /// `None` when the controller cannot tell.
    fn observed_capacity<'a>(
        &'a self,
        volume: &'a VolumeId,
    ) -> ControllerFuture<'a, Option<u64>, Self::Error>;
}

/// Kind of batch recorded by [`DryRunController`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionKind {
    /// [`OrchestrationController::create_volumes`].
    Create,
    /// [`OrchestrationController::expand_volume`].
    Expand,
    /// [`OrchestrationController::delete_volumes`].
    Delete,
    /// [`OrchestrationController::change_virtual_pool`].
    ChangeVirtualPool,
}

/// Batch accepted by [`DryRunController`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Submission {
    /// Which entry point received the batch.
    pub kind: SubmissionKind,
    /// Task the batch was submitted under.
    pub task: TaskId,
    /// Submitted descriptors.
    pub descriptors: Vec<VolumeDescriptor>,
}

/// Errors raised by [`DryRunController`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DryRunError {
    /// Raised when the submission log lock is poisoned.
    #[error("dry-run submission log unavailable: {0}")]
    Unavailable(String),
}

/// Controller that accepts every batch without provisioning anything.
///
/// Used by the `ruslan plan` command to show what would be submitted.
#[derive(Clone, Debug, Default)]
pub struct DryRunController {
    submissions: Arc<Mutex<Vec<Submission>>>,
}

impl DryRunController {
    /// Creates a controller with an empty submission log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every batch accepted so far.
    ///
    /// # Errors
    ///
    /// Returns [`DryRunError::Unavailable`] when the log lock is poisoned.
    pub fn submissions(&self) -> Result<Vec<Submission>, DryRunError> {
        self.submissions
            .lock()
            .map(|log| log.clone())
            .map_err(|err| DryRunError::Unavailable(err.to_string()))
    }

    fn record(
        &self,
        kind: SubmissionKind,
        descriptors: &[VolumeDescriptor],
        task: &TaskId,
    ) -> Result<(), DryRunError> {
        self.submissions
            .lock()
            .map_err(|err| DryRunError::Unavailable(err.to_string()))?
            .push(Submission {
                kind,
                task: task.clone(),
                descriptors: descriptors.to_vec(),
            });
        Ok(())
    }
}

impl OrchestrationController for DryRunController {
    type Error = DryRunError;

    fn create_volumes<'a>(
        &'a self,
        descriptors: &'a [VolumeDescriptor],
        task: &'a TaskId,
    ) -> ControllerFuture<'a, (), Self::Error> {
        Box::pin(async move { self.record(SubmissionKind::Create, descriptors, task) })
    }

    fn expand_volume<'a>(
        &'a self,
        descriptors: &'a [VolumeDescriptor],
        _new_size: u64,
        task: &'a TaskId,
    ) -> ControllerFuture<'a, (), Self::Error> {
        Box::pin(async move { self.record(SubmissionKind::Expand, descriptors, task) })
    }

    fn delete_volumes<'a>(
        &'a self,
        descriptors: &'a [VolumeDescriptor],
        task: &'a TaskId,
    ) -> ControllerFuture<'a, (), Self::Error> {
        Box::pin(async move { self.record(SubmissionKind::Delete, descriptors, task) })
    }

    fn change_virtual_pool<'a>(
        &'a self,
        descriptors: &'a [VolumeDescriptor],
        task: &'a TaskId,
    ) -> ControllerFuture<'a, (), Self::Error> {
        Box::pin(async move { self.record(SubmissionKind::ChangeVirtualPool, descriptors, task) })
    }

    fn observed_capacity<'a>(
        &'a self,
        _volume: &'a VolumeId,
    ) -> ControllerFuture<'a, Option<u64>, Self::Error> {
        Box::pin(async move { Ok(None) })
    }
}
