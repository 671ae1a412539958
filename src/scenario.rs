//! Dry-run scenarios: a store snapshot plus one request, read from JSON.
//!
//! The `ruslan` binary loads a scenario, runs it through the planner against
//! an in-memory store and a recording controller, and reports what would be
//! submitted.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::capacity::{
    CalculatorSet, CapacityError, CapacityReconciler, ReconcileRequest, Reconciliation,
};
use crate::config::PlannerSettings;
use crate::controller::{DryRunController, DryRunError, Submission};
use crate::lifecycle::{LifecycleOrchestrator, OperationFailure};
use crate::lock::InProcessLockService;
use crate::model::{TaskId, VolumeId};
use crate::recommendation::Proposal;
use crate::request::VolumeRequest;
use crate::scheduler::StaticScheduler;
use crate::store::{InMemoryStore, StoreSnapshot};
use crate::task::{InMemoryTaskTracker, TaskList};

/// Errors raised while loading or running a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// Raised when the scenario path has no file name.
    #[error("scenario path {path} does not name a file")]
    InvalidPath {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// Raised when the scenario file cannot be read.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the scenario file is not valid JSON for the scenario.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the planner rejects a creation scenario.
    #[error("planning failed: {0}")]
    Plan(#[from] OperationFailure<DryRunError>),
    /// Raised when capacities cannot be reconciled.
    #[error("reconciliation failed: {0}")]
    Capacity(#[from] CapacityError),
    /// Raised when the recording controller cannot be read back.
    #[error("dry run failed: {0}")]
    DryRun(#[from] DryRunError),
}

/// Creation scenario: a store, one request and the scheduler's proposals.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlanScenario {
    /// Records the request runs against.
    #[serde(default)]
    pub store: StoreSnapshot,
    /// Volumes to create.
    pub request: VolumeRequest,
    /// Placements proposed for the request.
    #[serde(default)]
    pub proposals: Vec<Proposal>,
    /// Task identifier; generated when absent.
    #[serde(default)]
    pub task: Option<TaskId>,
}

/// Capacity scenario: a store and the replication set to reconcile.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReconcileScenario {
    /// Records the volumes are read from.
    #[serde(default)]
    pub store: StoreSnapshot,
    /// Replication set members.
    pub volumes: Vec<VolumeId>,
    /// Requested capacity in bytes.
    pub requested_size: u64,
    /// Whether the request grows an existing set.
    #[serde(default)]
    pub expand: bool,
    /// Whether the request is part of a tier change.
    #[serde(default)]
    pub tier_change: bool,
}

/// Outcome of a creation scenario.
#[derive(Clone, Debug, Serialize)]
pub struct PlanReport {
    /// Task the request ran under.
    pub task: TaskId,
    /// Tasks created.
    pub tasks: TaskList,
    /// Batches the controller received, in order.
    pub submissions: Vec<Submission>,
}

/// Reads and parses the scenario at `path`.
///
/// # Errors
///
/// Returns [`ScenarioError::InvalidPath`], [`ScenarioError::Io`] or
/// [`ScenarioError::Parse`] when the file cannot be used.
pub fn load<T>(path: &Utf8Path) -> Result<T, ScenarioError>
where
    T: DeserializeOwned,
{
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| ScenarioError::InvalidPath {
        path: path.to_path_buf(),
    })?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| ScenarioError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        })?;
    let contents = dir.read_to_string(file_name).map_err(|err| ScenarioError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    debug!(%path, bytes = contents.len(), "read scenario");
    serde_json::from_str(&contents).map_err(|err| ScenarioError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Runs a creation scenario through the planner without touching real
/// storage.
///
/// # Errors
///
/// Returns [`ScenarioError::Plan`] when the request fails; the error keeps
/// the compensation report.
pub async fn run_plan(
    scenario: PlanScenario,
    settings: PlannerSettings,
) -> Result<PlanReport, ScenarioError> {
    let controller = DryRunController::new();
    let task = scenario.task.unwrap_or_else(TaskId::generate);
    let lifecycle = LifecycleOrchestrator::new(
        InMemoryStore::from_snapshot(scenario.store),
        controller.clone(),
        InMemoryTaskTracker::new(),
        InProcessLockService::new(),
        StaticScheduler::new(scenario.proposals.clone()),
    )
    .with_settings(settings);
    let tasks = lifecycle
        .create_volumes(&scenario.request, &scenario.proposals, &task)
        .await?;
    Ok(PlanReport {
        task,
        tasks,
        submissions: controller.submissions()?,
    })
}

/// Reconciles the capacities of a scenario's replication set.
///
/// # Errors
///
/// Returns [`ScenarioError::Capacity`] when no matching allocation exists
/// or a member cannot be read.
pub fn run_reconcile(
    scenario: ReconcileScenario,
    settings: PlannerSettings,
) -> Result<Reconciliation, ScenarioError> {
    let store = InMemoryStore::from_snapshot(scenario.store);
    let calculators = CalculatorSet::new();
    let reconciler = CapacityReconciler::new(&store, &calculators, settings.target_skew_bytes);
    let mut request = ReconcileRequest::new(&scenario.volumes, scenario.requested_size)
        .tier_change(scenario.tier_change);
    if scenario.expand {
        request = request.expand();
    }
    Ok(reconciler.reconcile(&request)?)
}
