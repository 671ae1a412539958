//! Shared fixtures for lifecycle BDD scenarios.

use std::time::Duration;

use ruslan::capacity::CapacityPlan;
use ruslan::model::{
    ProjectId, StorageFamily, StoragePoolId, StorageSystem, StorageSystemId, VirtualArrayId,
    VirtualPoolId,
};
use ruslan::test_support::{
    BRONZE, EAST, EAST_ARRAY, PROJECT, ProtectedSet, ScriptedController, ScriptedFailure, topology,
};
use ruslan::{
    InMemoryStore, InMemoryTaskTracker, InProcessLockService, LifecycleError, OperationFailure,
    PlannerSettings, StoreError, TaskList, Volume, VolumeId, VolumeStore,
};
use rstest::fixture;
use thiserror::Error;

/// Journal lock bound used by every scenario.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct LifecycleContext {
    pub store: InMemoryStore,
    pub controller: ScriptedController,
    pub tracker: InMemoryTaskTracker,
    pub locks: InProcessLockService,
    pub settings: PlannerSettings,
    pub held_lock: Option<String>,
    pub protected_set: Option<ProtectedSet>,
    pub group_members: Vec<VolumeId>,
    pub pair: Option<(VolumeId, VolumeId)>,
    pub outcome: Option<LifecycleResult>,
    pub plan: Option<CapacityPlan>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    PlacementExhausted,
    CapacityMismatch,
    InvalidTopology,
    ControllerSubmission,
    LockTimeout,
    Other,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LifecycleFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum LifecycleResult {
    Success(TaskList),
    Failure(LifecycleFailure),
}

impl LifecycleResult {
    pub fn from_outcome(result: Result<TaskList, OperationFailure<ScriptedFailure>>) -> Self {
        match result {
            Ok(tasks) => Self::Success(tasks),
            Err(err) => Self::Failure(LifecycleFailure {
                kind: failure_kind(err.primary()),
                message: err.to_string(),
            }),
        }
    }
}

const fn failure_kind(err: &LifecycleError<ScriptedFailure>) -> FailureKind {
    match err {
        LifecycleError::PlacementExhausted => FailureKind::PlacementExhausted,
        LifecycleError::CapacityMismatch(_) => FailureKind::CapacityMismatch,
        LifecycleError::InvalidTopology { .. } => FailureKind::InvalidTopology,
        LifecycleError::ControllerSubmission { .. } => FailureKind::ControllerSubmission,
        LifecycleError::LockTimeout { .. } => FailureKind::LockTimeout,
        _ => FailureKind::Other,
    }
}

#[derive(Clone, Debug, Error)]
pub enum LifecycleTestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid lifecycle fixture: {0}")]
    Fixture(String),
}

pub type LifecycleContextResult = Result<LifecycleContext, LifecycleTestError>;

#[fixture]
pub fn lifecycle_context_result() -> LifecycleContextResult {
    build_lifecycle_context()
}

#[fixture]
pub fn lifecycle_context(lifecycle_context_result: LifecycleContextResult) -> LifecycleContext {
    lifecycle_context_result
        .unwrap_or_else(|err| panic!("lifecycle context fixture should initialise: {err}"))
}

fn build_lifecycle_context() -> LifecycleContextResult {
    Ok(LifecycleContext {
        store: topology(),
        controller: ScriptedController::new(),
        tracker: InMemoryTaskTracker::new(),
        locks: InProcessLockService::new(),
        settings: PlannerSettings::default().with_lock_timeout(LOCK_TIMEOUT),
        held_lock: None,
        protected_set: None,
        group_members: Vec::new(),
        pair: None,
        outcome: None,
        plan: None,
    })
}

pub fn parse_family(name: &str) -> Result<StorageFamily, LifecycleTestError> {
    match name {
        "vmax2" => Ok(StorageFamily::Vmax2),
        "vmax3" => Ok(StorageFamily::Vmax3),
        "xtremio" => Ok(StorageFamily::Xtremio),
        "vnxblock" => Ok(StorageFamily::VnxBlock),
        "unity" => Ok(StorageFamily::Unity),
        "generic" => Ok(StorageFamily::Generic),
        _ => Err(LifecycleTestError::Fixture(format!(
            "unknown storage family: {name}"
        ))),
    }
}

/// Seeds a storage system of `family` named after it and returns its id.
pub fn seed_family_system(
    store: &InMemoryStore,
    family: StorageFamily,
) -> Result<StorageSystemId, LifecycleTestError> {
    let id = StorageSystemId::new(format!("array-{}", family.name()));
    if store.storage_system(&id)?.is_some() {
        return Ok(id);
    }
    store.put_storage_system(StorageSystem {
        id: id.clone(),
        label: id.to_string(),
        family,
    })?;
    Ok(id)
}

/// Plain volume record on `system` in the east array.
pub fn placed_volume(id: &str, system: &StorageSystemId, capacity: u64) -> Volume {
    let mut volume = Volume::new(
        VolumeId::new(id),
        id,
        VirtualArrayId::new(EAST),
        VirtualPoolId::new(BRONZE),
        ProjectId::new(PROJECT),
    );
    volume.capacity = capacity;
    volume.storage_system = Some(system.clone());
    volume.storage_pool = Some(StoragePoolId::new(format!("{system}-pool")));
    volume
}

/// Storage system the replication group scenarios place their members on.
pub fn group_system() -> StorageSystemId {
    StorageSystemId::new(EAST_ARRAY)
}
