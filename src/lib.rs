//! Core library for the Ruslan protected-volume provisioning planner.
//!
//! The crate turns placement recommendations for replicated block storage
//! into ordered volume descriptors, reconciles capacities across array
//! families, and drives create, expand, delete and tier change requests
//! through an orchestration controller with compensation on failure
//! (validate → compile → reconcile → track → submit).

pub mod capacity;
pub mod compiler;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod lifecycle;
pub mod lock;
pub mod migration;
pub mod model;
pub mod recommendation;
pub mod request;
pub mod scenario;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod test_support;

pub use capacity::{
    AllocationCalculator, CalculatorSet, CapacityError, CapacityPlan, CapacityReconciler,
    ReconcileRequest, Reconciliation,
};
pub use compiler::{CompileError, JournalSizePolicy, ProvisionLedger, VolumeDescriptorCompiler};
pub use config::{ConfigError, PlannerConfig, PlannerSettings};
pub use controller::{DryRunController, DryRunError, OrchestrationController, Submission};
pub use descriptor::{DescriptorAction, DescriptorKind, DescriptorParam, VolumeDescriptor};
pub use lifecycle::{
    CompensationFailure, CompensationStep, JournalCapacityRequest, LifecycleError,
    LifecycleOrchestrator, OperationFailure, TierChange, TierChangeRequest,
};
pub use lock::{InProcessLockService, LockError, NamedLockService};
pub use migration::{MigrationError, MigrationGrouper, MigrationTarget};
pub use model::{Personality, TaskId, Volume, VolumeId};
pub use recommendation::{PlacementAdapter, PlacementError, Proposal};
pub use request::{RequestError, VolumeRequest};
pub use scenario::{PlanReport, PlanScenario, ReconcileScenario, ScenarioError};
pub use scheduler::{Scheduler, StaticScheduler};
pub use store::{InMemoryStore, StoreError, StoreSnapshot, VolumeStore};
pub use task::{InMemoryTaskTracker, OperationKind, TaskList, TaskTracker};
