//! Lifecycle orchestration: create, expand, delete, tier change and journal
//! capacity requests.
//!
//! Every entry point follows the same shape: validate, compile and
//! reconcile, create tasks, then submit one batch to the controller. Any
//! failure after the first side effect runs compensation for everything the
//! request did, and compensation failures are reported next to the primary
//! error in [`OperationFailure`].

use tracing::{info, warn};

use crate::capacity::{CalculatorSet, CapacityReconciler, ReconcileRequest};
use crate::compiler::{ProvisionLedger, VolumeDescriptorCompiler};
use crate::config::PlannerSettings;
use crate::controller::OrchestrationController;
use crate::lock::NamedLockService;
use crate::model::{ConsistencyGroupId, Personality, TaskId, VirtualPoolId, Volume, VolumeId};
use crate::recommendation::{PlacementAdapter, Proposal};
use crate::request::{ChangeContext, RequestCapabilities, VolumeRequest};
use crate::scheduler::{PlacementCriteria, Scheduler};
use crate::store::VolumeStore;
use crate::task::{OperationKind, TaskList, TaskTracker};

mod compensation;
mod delete;
mod error;
mod expand;
mod tier;

pub use error::{CompensationFailure, CompensationStep, LifecycleError, OperationFailure};
pub use tier::{TierChange, TierChangeRequest};

/// Request to add journal capacity to one copy of a consistency group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalCapacityRequest {
    /// Protected consistency group.
    pub consistency_group: ConsistencyGroupId,
    /// Copy receiving the journals, matched ignoring ASCII case.
    pub copy_name: String,
    /// Virtual pool the journals are placed in.
    pub virtual_pool: VirtualPoolId,
    /// Size of each journal in bytes.
    pub size_bytes: u64,
    /// Number of journals to add.
    pub count: u32,
}

/// Coordinates the planner components and the external collaborators for
/// each lifecycle operation.
#[derive(Debug)]
pub struct LifecycleOrchestrator<S, C, T, L, P> {
    store: S,
    controller: C,
    tracker: T,
    locks: L,
    scheduler: P,
    calculators: CalculatorSet,
    settings: PlannerSettings,
}

impl<S, C, T, L, P> LifecycleOrchestrator<S, C, T, L, P>
where
    S: VolumeStore,
    C: OrchestrationController,
    T: TaskTracker,
    L: NamedLockService,
    P: Scheduler,
{
    /// Creates an orchestrator with default settings and the built-in
    /// allocation calculators.
    #[must_use]
    pub fn new(store: S, controller: C, tracker: T, locks: L, scheduler: P) -> Self {
        Self {
            store,
            controller,
            tracker,
            locks,
            scheduler,
            calculators: CalculatorSet::new(),
            settings: PlannerSettings::default(),
        }
    }

    /// Replaces the planner settings.
    #[must_use]
    pub const fn with_settings(mut self, settings: PlannerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the allocation calculators.
    #[must_use]
    pub fn with_calculators(mut self, calculators: CalculatorSet) -> Self {
        self.calculators = calculators;
        self
    }

    /// Returns the persistence collaborator.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Returns the orchestration controller.
    pub const fn controller(&self) -> &C {
        &self.controller
    }

    /// Returns the task tracker.
    pub const fn tracker(&self) -> &T {
        &self.tracker
    }

    /// Creates the volumes of `request` on the placements in `proposals`.
    ///
    /// A request naming `change_source` moves that existing volume into the
    /// requested protected tier instead of creating a new source.
    ///
    /// # Errors
    ///
    /// Returns [`OperationFailure`] when validation, compilation,
    /// reconciliation or submission fails. Records created for the request
    /// are marked for deletion, updated records are restored, and created
    /// tasks are marked errored before the error is returned.
    pub async fn create_volumes(
        &self,
        request: &VolumeRequest,
        proposals: &[Proposal],
        task: &TaskId,
    ) -> Result<TaskList, OperationFailure<C::Error>> {
        request.validate().map_err(LifecycleError::<C::Error>::from)?;
        let capabilities = self.capabilities_for(request)?;
        let operation = if capabilities.change().is_some() {
            OperationKind::ChangeVirtualPool
        } else {
            OperationKind::CreateVolume
        };
        self.provision(request, &capabilities, proposals, task, operation)
            .await
    }

    /// Adds `request.count` journals to one copy of a protected consistency
    /// group. The new journals are named `<copy>_<task>` and are the
    /// request's task volumes.
    ///
    /// # Errors
    ///
    /// Returns [`OperationFailure`] with [`LifecycleError::InvalidTopology`]
    /// when the group is unprotected, has no source, or has no copy named
    /// `request.copy_name`, and [`LifecycleError::PlacementExhausted`] when
    /// the scheduler has no placement. Later failures compensate as
    /// [`Self::create_volumes`] does.
    pub async fn add_journal_capacity(
        &self,
        request: &JournalCapacityRequest,
        task: &TaskId,
    ) -> Result<TaskList, OperationFailure<C::Error>> {
        let group = self
            .store
            .require_consistency_group(&request.consistency_group)
            .map_err(LifecycleError::<C::Error>::from)?;
        if group.protection_system.is_none() {
            return Err(LifecycleError::<C::Error>::topology(format!(
                "consistency group {} is not protected",
                group.label
            ))
            .into());
        }
        let members = self
            .store
            .volumes_in_consistency_group(&group.id)
            .map_err(LifecycleError::<C::Error>::from)?;
        let source = members
            .iter()
            .find(|member| member.personality == Personality::Source)
            .ok_or_else(|| {
                LifecycleError::<C::Error>::topology(format!(
                    "consistency group {} has no source volumes",
                    group.label
                ))
            })?;
        let copy_array = self.copy_virtual_array(source, &request.copy_name)?;

        let journal_request = VolumeRequest {
            name: format!("{}_{task}", request.copy_name),
            size_bytes: request.size_bytes,
            count: request.count,
            virtual_pool: request.virtual_pool.clone(),
            virtual_array: copy_array,
            project: source.project.clone(),
            consistency_group: Some(group.id.clone()),
            change_source: None,
        };
        journal_request.validate().map_err(LifecycleError::<C::Error>::from)?;
        let proposals = self
            .scheduler
            .schedule_storage(&PlacementCriteria::from_request(&journal_request))
            .map_err(LifecycleError::<C::Error>::from)?;
        let capabilities = RequestCapabilities::from_request(&journal_request).for_journal_only();
        info!(
            group = %group.label,
            copy = %request.copy_name,
            count = request.count,
            "adding journal capacity"
        );
        self.provision(
            &journal_request,
            &capabilities,
            &proposals,
            task,
            OperationKind::AddJournalCapacity,
        )
        .await
    }

    /// Resolves the virtual array of `copy_name` among `source`, its
    /// backing legs and its targets. Names containing `standby` refer to
    /// the dual-active standby copy on the high-availability leg.
    fn copy_virtual_array(
        &self,
        source: &Volume,
        copy_name: &str,
    ) -> Result<crate::model::VirtualArrayId, LifecycleError<C::Error>> {
        if copy_name.to_ascii_lowercase().contains("standby") {
            let legs = self.store.require_volumes(&source.backing_volumes)?;
            return legs
                .into_iter()
                .find(|leg| leg.virtual_array != source.virtual_array)
                .map(|leg| leg.virtual_array)
                .ok_or_else(|| {
                    LifecycleError::topology(format!(
                        "copy {copy_name} names a standby copy but {} has no high-availability leg",
                        source.label
                    ))
                });
        }
        if source.in_copy(copy_name) {
            return Ok(source.virtual_array.clone());
        }
        let legs = self.store.require_volumes(&source.backing_volumes)?;
        let targets = self.store.require_volumes(&source.protection_targets)?;
        legs.iter()
            .chain(targets.iter())
            .find(|volume| volume.in_copy(copy_name))
            .map(|volume| volume.virtual_array.clone())
            .ok_or_else(|| {
                LifecycleError::topology(format!(
                    "copy {copy_name} was not found in the consistency group"
                ))
            })
    }

    fn capabilities_for(
        &self,
        request: &VolumeRequest,
    ) -> Result<RequestCapabilities, LifecycleError<C::Error>> {
        let base = RequestCapabilities::from_request(request);
        let Some(volume_id) = &request.change_source else {
            return Ok(base);
        };
        let volume = self.store.require_volume(volume_id)?;
        Ok(base.for_change(ChangeContext {
            volume: volume.id,
            old_virtual_pool: volume.virtual_pool,
            already_protected: volume.personality == Personality::Source
                && volume.protection_system.is_some(),
        }))
    }

    /// Runs the creation pipeline, compensating on failure.
    async fn provision(
        &self,
        request: &VolumeRequest,
        capabilities: &RequestCapabilities,
        proposals: &[Proposal],
        task: &TaskId,
        operation: OperationKind,
    ) -> Result<TaskList, OperationFailure<C::Error>> {
        let mut ledger = ProvisionLedger::new();
        let mut tasks = TaskList::default();
        match self
            .try_provision(request, capabilities, proposals, task, operation, &mut ledger, &mut tasks)
            .await
        {
            Ok(()) => Ok(tasks),
            Err(primary) => Err(self.compensate(primary, &ledger, &tasks, task)),
        }
    }

    #[expect(
        clippy::too_many_arguments,
        reason = "the ledger and task list are threaded through so compensation sees partial progress"
    )]
    async fn try_provision(
        &self,
        request: &VolumeRequest,
        capabilities: &RequestCapabilities,
        proposals: &[Proposal],
        task: &TaskId,
        operation: OperationKind,
        ledger: &mut ProvisionLedger,
        tasks: &mut TaskList,
    ) -> Result<(), LifecycleError<C::Error>> {
        let recommendations =
            PlacementAdapter::new(&self.store).normalize(proposals, &request.virtual_pool)?;
        let compiler = VolumeDescriptorCompiler::new(&self.store, &self.locks, self.settings);
        let mut compilation = compiler
            .compile(&recommendations, request, capabilities, ledger)
            .await?;

        let reconciler = CapacityReconciler::new(
            &self.store,
            &self.calculators,
            self.settings.target_skew_bytes,
        );
        for set in &compilation.replication_sets {
            let Some(first) = set.first() else {
                continue;
            };
            let requested = self.store.require_volume(first)?.capacity;
            let reconciliation = reconciler.reconcile(
                &ReconcileRequest::new(set, requested).tier_change(capabilities.change().is_some()),
            )?;
            reconciler.persist(&reconciliation)?;
        }
        compilation.apply_capacities(&self.store)?;

        for volume in &compilation.task_volumes {
            tasks.push(self.tracker.create_task(volume, operation, task)?);
        }
        info!(
            task = %task,
            operation = operation.name(),
            descriptors = compilation.descriptors.len(),
            "submitting descriptors"
        );
        let submitted = if capabilities.change().is_some() {
            self.controller
                .change_virtual_pool(&compilation.descriptors, task)
                .await
        } else {
            self.controller
                .create_volumes(&compilation.descriptors, task)
                .await
        };
        submitted.map_err(|source| {
            warn!(task = %task, error = %source, "controller rejected the batch");
            LifecycleError::ControllerSubmission { operation, source }
        })
    }

    fn create_tasks(
        &self,
        volumes: &[VolumeId],
        operation: OperationKind,
        task: &TaskId,
    ) -> Result<TaskList, LifecycleError<C::Error>> {
        let mut tasks = TaskList::default();
        for volume in volumes {
            tasks.push(self.tracker.create_task(volume, operation, task)?);
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests;
