//! Placement scheduler collaborator.
//!
//! The scheduler chooses arrays and pools; the planner only consumes its
//! proposals. Tier changes and journal additions ask it for placements
//! through [`Scheduler::schedule_storage`].

use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;

use crate::model::{ConsistencyGroupId, ProjectId, VirtualArrayId, VirtualPoolId, VolumeId};
use crate::recommendation::Proposal;
use crate::request::VolumeRequest;

/// Errors raised by scheduler implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SchedulerError {
    /// Raised when the scheduler cannot be consulted.
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

/// Inputs a scheduler needs to place one request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PlacementCriteria {
    /// Virtual array requested.
    pub virtual_array: VirtualArrayId,
    /// Virtual pool requested.
    pub virtual_pool: VirtualPoolId,
    /// Owning project.
    pub project: ProjectId,
    /// Size of each volume in bytes.
    pub size_bytes: u64,
    /// Number of volumes.
    pub count: u32,
    /// Consistency group the volumes join.
    pub consistency_group: Option<ConsistencyGroupId>,
    /// Existing volume whose tier changes.
    pub change_source: Option<VolumeId>,
}

impl PlacementCriteria {
    /// Copies the placement inputs out of `request`.
    #[must_use]
    pub fn from_request(request: &VolumeRequest) -> Self {
        Self {
            virtual_array: request.virtual_array.clone(),
            virtual_pool: request.virtual_pool.clone(),
            project: request.project.clone(),
            size_bytes: request.size_bytes,
            count: request.count,
            consistency_group: request.consistency_group.clone(),
            change_source: request.change_source.clone(),
        }
    }
}

/// Abstraction over the placement scheduler for dependency injection.
pub trait Scheduler {
    /// Proposes placements satisfying `criteria`. An empty result means no
    /// placement is available.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] when the scheduler cannot be consulted.
    fn schedule_storage(&self, criteria: &PlacementCriteria)
    -> Result<Vec<Proposal>, SchedulerError>;
}

/// Scheduler answering every request with the same proposals.
///
/// Used by the dry-run commands, where proposals come from the scenario
/// file, and by tests.
#[derive(Clone, Debug, Default)]
pub struct StaticScheduler {
    proposals: Vec<Proposal>,
    requests: Arc<Mutex<Vec<PlacementCriteria>>>,
}

impl StaticScheduler {
    /// Creates a scheduler returning `proposals`.
    #[must_use]
    pub fn new(proposals: Vec<Proposal>) -> Self {
        Self {
            proposals,
            requests: Arc::default(),
        }
    }

    /// Returns the criteria received so far.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Unavailable`] when the request log lock is
    /// poisoned.
    pub fn requests(&self) -> Result<Vec<PlacementCriteria>, SchedulerError> {
        self.requests
            .lock()
            .map(|log| log.clone())
            .map_err(|err| SchedulerError::Unavailable(err.to_string()))
    }
}

impl Scheduler for StaticScheduler {
    fn schedule_storage(
        &self,
        criteria: &PlacementCriteria,
    ) -> Result<Vec<Proposal>, SchedulerError> {
        self.requests
            .lock()
            .map_err(|err| SchedulerError::Unavailable(err.to_string()))?
            .push(criteria.clone());
        Ok(self.proposals.clone())
    }
}
