//! Task/status tracker collaborator.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;

use crate::model::{TaskId, VolumeId};

/// Operation recorded against a task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Volume creation.
    CreateVolume,
    /// Volume expansion.
    ExpandVolume,
    /// Volume deletion.
    DeleteVolume,
    /// Virtual pool (tier) change.
    ChangeVirtualPool,
    /// Journal capacity addition.
    AddJournalCapacity,
}

impl OperationKind {
    /// Returns the lowercase name used in log fields and messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CreateVolume => "create volume",
            Self::ExpandVolume => "expand volume",
            Self::DeleteVolume => "delete volume",
            Self::ChangeVirtualPool => "change virtual pool",
            Self::AddJournalCapacity => "add journal capacity",
        }
    }
}

/// Task state as seen by the tracker.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted and progressing.
    Pending,
    /// Forced into the error state.
    Error {
        /// Human-readable failure message.
        message: String,
    },
}

/// Per-volume operation registered under a task.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Task {
    /// Task the operation belongs to.
    pub id: TaskId,
    /// Volume the operation acts on.
    pub volume: VolumeId,
    /// Kind of operation.
    pub operation: OperationKind,
    /// Current status.
    pub status: TaskStatus,
}

/// Tasks created for one request.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TaskList {
    tasks: Vec<Task>,
}

impl TaskList {
    /// Returns the tasks in creation order.
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Returns the number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` when no tasks were created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns the volumes covered by the tasks.
    #[must_use]
    pub fn volumes(&self) -> Vec<VolumeId> {
        self.tasks.iter().map(|task| task.volume.clone()).collect()
    }

    pub(crate) fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }
}

/// Errors raised by tracker implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TrackerError {
    /// Raised when the tracker rejects or cannot record the update.
    #[error("task tracker unavailable: {0}")]
    Unavailable(String),
    /// Raised when marking a task that was never created.
    #[error("no {volume} operation recorded under task {task}")]
    UnknownTask {
        /// Task identifier.
        task: TaskId,
        /// Volume the operation was expected on.
        volume: VolumeId,
    },
}

/// Abstraction over the task/status tracker for dependency injection.
pub trait TaskTracker {
    /// Registers an operation on `volume` under `task`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] when the tracker cannot record the task.
    fn create_task(
        &self,
        volume: &VolumeId,
        operation: OperationKind,
        task: &TaskId,
    ) -> Result<Task, TrackerError>;

    /// Forces the operation on `volume` under `task` into the error state.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] when the tracker cannot record the update.
    fn mark_error(&self, volume: &VolumeId, task: &TaskId, message: &str)
    -> Result<(), TrackerError>;
}

/// Tracker keeping every task in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTaskTracker {
    tasks: Arc<Mutex<Vec<Task>>>,
}

impl InMemoryTaskTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all recorded tasks.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Unavailable`] when the tracker lock is poisoned.
    pub fn tasks(&self) -> Result<Vec<Task>, TrackerError> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Task>>, TrackerError> {
        self.tasks
            .lock()
            .map_err(|err| TrackerError::Unavailable(format!("tracker lock poisoned: {err}")))
    }
}

impl TaskTracker for InMemoryTaskTracker {
    fn create_task(
        &self,
        volume: &VolumeId,
        operation: OperationKind,
        task: &TaskId,
    ) -> Result<Task, TrackerError> {
        let created = Task {
            id: task.clone(),
            volume: volume.clone(),
            operation,
            status: TaskStatus::Pending,
        };
        self.lock()?.push(created.clone());
        Ok(created)
    }

    fn mark_error(
        &self,
        volume: &VolumeId,
        task: &TaskId,
        message: &str,
    ) -> Result<(), TrackerError> {
        let mut tasks = self.lock()?;
        let entry = tasks
            .iter_mut()
            .find(|entry| &entry.id == task && &entry.volume == volume)
            .ok_or_else(|| TrackerError::UnknownTask {
                task: task.clone(),
                volume: volume.clone(),
            })?;
        entry.status = TaskStatus::Error {
            message: message.to_owned(),
        };
        Ok(())
    }
}
