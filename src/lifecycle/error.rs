//! Error types for lifecycle operations.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::capacity::CapacityError;
use crate::compiler::{CompileError, PolicyError};
use crate::migration::MigrationError;
use crate::recommendation::PlacementError;
use crate::request::RequestError;
use crate::scheduler::SchedulerError;
use crate::store::StoreError;
use crate::task::{OperationKind, TrackerError};

/// Errors raised by a lifecycle operation before or during submission.
#[derive(Debug, Error)]
pub enum LifecycleError<ControllerError>
where
    ControllerError: std::error::Error + 'static,
{
    /// Raised when the scheduler has no placement for the request.
    #[error("no placement recommendations are available for the request")]
    PlacementExhausted,
    /// Raised when replicated volumes cannot be given matching capacities.
    #[error("capacity mismatch: {0}")]
    CapacityMismatch(#[source] CapacityError),
    /// Raised when recommendations or records describe an impossible
    /// topology.
    #[error("invalid topology: {reason}")]
    InvalidTopology {
        /// Description of what is missing or inconsistent.
        reason: String,
    },
    /// Raised when the controller rejects a batch.
    #[error("controller rejected the {} batch: {source}", .operation.name())]
    ControllerSubmission {
        /// Operation the batch belonged to.
        operation: OperationKind,
        /// Controller specific error.
        #[source]
        source: ControllerError,
    },
    /// Raised when the journal naming lock is not acquired in time.
    #[error("timed out after {waited_ms} ms waiting for lock {key}")]
    LockTimeout {
        /// Lock key.
        key: String,
        /// Time waited in milliseconds.
        waited_ms: u128,
    },
    /// Raised when the lock service cannot be used.
    #[error("lock service unavailable: {0}")]
    Lock(String),
    /// Raised when a record cannot be read or written.
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
    /// Raised when a task cannot be created.
    #[error("task tracking failed: {0}")]
    Tracker(#[from] TrackerError),
    /// Raised when the request is malformed.
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),
    /// Raised when a pool carries an unparsable journal policy.
    #[error("invalid pool configuration: {0}")]
    Policy(#[from] PolicyError),
    /// Raised when the scheduler cannot be consulted.
    #[error("scheduler failed: {0}")]
    Scheduler(#[from] SchedulerError),
    /// Raised when the operation is not supported for the volumes named.
    #[error("operation not supported: {reason}")]
    NotSupported {
        /// Description of the unsupported combination.
        reason: String,
    },
}

impl<E> LifecycleError<E>
where
    E: std::error::Error + 'static,
{
    pub(crate) fn topology(reason: impl Into<String>) -> Self {
        Self::InvalidTopology {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_supported(reason: impl Into<String>) -> Self {
        Self::NotSupported {
            reason: reason.into(),
        }
    }
}

impl<E> From<CompileError> for LifecycleError<E>
where
    E: std::error::Error + 'static,
{
    fn from(value: CompileError) -> Self {
        match value {
            CompileError::InvalidTopology { reason } => Self::InvalidTopology { reason },
            CompileError::LockTimeout { key, waited_ms } => Self::LockTimeout { key, waited_ms },
            CompileError::Lock(message) => Self::Lock(message),
            CompileError::Store(err) => Self::Store(err),
            CompileError::Policy(err) => Self::Policy(err),
        }
    }
}

impl<E> From<PlacementError> for LifecycleError<E>
where
    E: std::error::Error + 'static,
{
    fn from(value: PlacementError) -> Self {
        match value {
            PlacementError::Exhausted => Self::PlacementExhausted,
            PlacementError::InvalidShape { reason } => Self::InvalidTopology { reason },
            PlacementError::Store(err) => Self::Store(err),
        }
    }
}

impl<E> From<CapacityError> for LifecycleError<E>
where
    E: std::error::Error + 'static,
{
    fn from(value: CapacityError) -> Self {
        match value {
            CapacityError::Store(err) => Self::Store(err),
            CapacityError::UnplacedVolume { volume } => Self::InvalidTopology {
                reason: format!("volume {volume} has no storage system"),
            },
            mismatch @ CapacityError::Mismatch { .. } => Self::CapacityMismatch(mismatch),
        }
    }
}

impl<E> From<MigrationError> for LifecycleError<E>
where
    E: std::error::Error + 'static,
{
    fn from(value: MigrationError) -> Self {
        match value {
            partial @ MigrationError::PartialGroup { .. } => Self::InvalidTopology {
                reason: partial.to_string(),
            },
            MigrationError::Store(err) => Self::Store(err),
        }
    }
}

/// Compensation step that failed after a primary error.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStep {
    /// Restoring a pre-request record snapshot.
    RestoreRecord,
    /// Marking a created record for deletion.
    DeleteVolume,
    /// Forcing a task into the error state.
    MarkTaskError,
    /// Restoring a tracked capacity after a failed expansion.
    RestoreCapacity,
    /// A failed expansion the controller reports as partly applied.
    PartialExpansion,
}

impl CompensationStep {
    /// Returns the lowercase name used in messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RestoreRecord => "restore record",
            Self::DeleteVolume => "delete volume",
            Self::MarkTaskError => "mark task error",
            Self::RestoreCapacity => "restore capacity",
            Self::PartialExpansion => "partial expansion",
        }
    }
}

/// One compensation that could not be completed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CompensationFailure {
    /// Step that failed.
    pub step: CompensationStep,
    /// Entity the step acted on.
    pub entity: String,
    /// Human-readable failure message.
    pub message: String,
}

impl fmt::Display for CompensationFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} {}: {}", self.step.name(), self.entity, self.message)
    }
}

/// Failure of a lifecycle operation: the primary error and every
/// compensation that failed while undoing its side effects.
#[derive(Debug)]
pub struct OperationFailure<ControllerError>
where
    ControllerError: std::error::Error + 'static,
{
    primary: LifecycleError<ControllerError>,
    compensations: Vec<CompensationFailure>,
}

impl<E> OperationFailure<E>
where
    E: std::error::Error + 'static,
{
    /// Wraps `primary` with the compensation failures gathered undoing it.
    #[must_use]
    pub const fn new(primary: LifecycleError<E>, compensations: Vec<CompensationFailure>) -> Self {
        Self {
            primary,
            compensations,
        }
    }

    /// Returns the error that caused the operation to fail.
    #[must_use]
    pub const fn primary(&self) -> &LifecycleError<E> {
        &self.primary
    }

    /// Returns the compensations that could not be completed, in order.
    #[must_use]
    pub fn compensations(&self) -> &[CompensationFailure] {
        &self.compensations
    }

    /// Consumes the failure, returning the primary error.
    #[must_use]
    pub fn into_primary(self) -> LifecycleError<E> {
        self.primary
    }
}

impl<E> From<LifecycleError<E>> for OperationFailure<E>
where
    E: std::error::Error + 'static,
{
    fn from(primary: LifecycleError<E>) -> Self {
        Self::new(primary, Vec::new())
    }
}

impl<E> fmt::Display for OperationFailure<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.primary)?;
        for failure in &self.compensations {
            write!(formatter, " (compensation also failed: {failure})")?;
        }
        Ok(())
    }
}

impl<E> std::error::Error for OperationFailure<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.primary)
    }
}
