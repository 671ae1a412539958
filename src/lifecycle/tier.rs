//! Virtual pool changes: protection changes and data migration.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{LifecycleError, LifecycleOrchestrator, OperationFailure};
use crate::controller::OrchestrationController;
use crate::descriptor::{DescriptorAction, DescriptorKind, DescriptorParam, VolumeDescriptor};
use crate::lock::NamedLockService;
use crate::migration::{MigrationGrouper, MigrationTarget};
use crate::model::{
    ConsistencyGroupId, CopyMode, Personality, TaskId, VirtualPool, VirtualPoolId, Volume, VolumeId,
};
use crate::request::{RequestError, VolumeRequest};
use crate::scheduler::{PlacementCriteria, Scheduler};
use crate::store::VolumeStore;
use crate::task::{OperationKind, TaskList, TaskTracker};

/// Kind of virtual pool change requested.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TierChange {
    /// Protect an unprotected volume, placing it in a new consistency group.
    AddProtection {
        /// Group the volume joins.
        consistency_group: ConsistencyGroupId,
    },
    /// Add a dual-active standby copy to a protected source.
    UpgradeToDualActive,
    /// Switch the replication mode of a protected consistency group.
    ChangeCopyMode {
        /// Mode the group switches to.
        mode: CopyMode,
    },
    /// Drop protection from sources, deleting their targets and journals.
    RemoveProtection,
    /// Move volumes to new placements.
    DataMigration {
        /// Volumes that physically move and where to.
        migrations: Vec<MigrationTarget>,
    },
}

impl TierChange {
    const fn single_volume(&self) -> bool {
        matches!(self, Self::AddProtection { .. } | Self::UpgradeToDualActive)
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::AddProtection { .. } => "add protection",
            Self::UpgradeToDualActive => "upgrade to dual-active",
            Self::ChangeCopyMode { .. } => "change copy mode",
            Self::RemoveProtection => "remove protection",
            Self::DataMigration { .. } => "data migration",
        }
    }
}

/// Request to move volumes into another virtual pool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TierChangeRequest {
    /// Volumes the change was requested for.
    pub volumes: Vec<VolumeId>,
    /// Pool the volumes move to.
    pub new_virtual_pool: VirtualPoolId,
    /// What the change does.
    pub change: TierChange,
}

impl<S, C, T, L, P> LifecycleOrchestrator<S, C, T, L, P>
where
    S: VolumeStore,
    C: OrchestrationController,
    T: TaskTracker,
    L: NamedLockService,
    P: Scheduler,
{
    /// Moves `request.volumes` into `request.new_virtual_pool`.
    ///
    /// Protection additions and dual-active upgrades consult the scheduler
    /// and run through the creation pipeline with the existing volume as
    /// the change source. Copy mode changes, protection removal and data
    /// migration submit a single change batch directly.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotSupported`] when the change does not
    /// apply to the volumes named, [`LifecycleError::PlacementExhausted`]
    /// when the scheduler has no placement, [`LifecycleError::InvalidTopology`]
    /// when a replication group would be split, and
    /// [`LifecycleError::ControllerSubmission`] when the controller rejects
    /// the batch.
    pub async fn change_virtual_pool(
        &self,
        request: &TierChangeRequest,
        task: &TaskId,
    ) -> Result<TaskList, OperationFailure<C::Error>> {
        if request.volumes.is_empty() {
            return Err(LifecycleError::<C::Error>::from(RequestError::Validation(
                "a tier change names at least one volume".to_owned(),
            ))
            .into());
        }
        if request.change.single_volume() && request.volumes.len() > 1 {
            return Err(LifecycleError::<C::Error>::not_supported(format!(
                "{} applies to one volume at a time",
                request.change.name()
            ))
            .into());
        }
        let pool = self
            .store
            .require_virtual_pool(&request.new_virtual_pool)
            .map_err(LifecycleError::<C::Error>::from)?;
        let volumes = self
            .store
            .require_volumes(&request.volumes)
            .map_err(LifecycleError::<C::Error>::from)?;
        info!(
            task = %task,
            change = request.change.name(),
            pool = %pool.label,
            volumes = volumes.len(),
            "changing virtual pool"
        );

        match &request.change {
            TierChange::AddProtection { consistency_group } => {
                let creation = self.add_protection_request(&volumes, &pool, consistency_group)?;
                self.schedule_and_create(&creation, task).await
            }
            TierChange::UpgradeToDualActive => {
                let creation = self.dual_active_request(&volumes, &pool)?;
                self.schedule_and_create(&creation, task).await
            }
            TierChange::ChangeCopyMode { mode } => {
                let descriptors = self.copy_mode_descriptors(&volumes, &pool, *mode)?;
                self.submit_change(&descriptors, &request.volumes, task).await
            }
            TierChange::RemoveProtection => {
                let descriptors = self.remove_protection_descriptors(&volumes, &pool)?;
                self.submit_change(&descriptors, &request.volumes, task).await
            }
            TierChange::DataMigration { migrations } => {
                let descriptors = MigrationGrouper::new(&self.store)
                    .plan(&request.volumes, migrations, &pool.id)
                    .map_err(LifecycleError::<C::Error>::from)?;
                self.submit_change(&descriptors, &request.volumes, task).await
            }
        }
    }

    fn add_protection_request(
        &self,
        volumes: &[Volume],
        pool: &VirtualPool,
        consistency_group: &ConsistencyGroupId,
    ) -> Result<VolumeRequest, LifecycleError<C::Error>> {
        let volume = single(volumes)?;
        if pool.protection.is_none() {
            return Err(LifecycleError::not_supported(format!(
                "pool {} carries no protection",
                pool.label
            )));
        }
        if let Some(existing) = &volume.consistency_group {
            return Err(LifecycleError::not_supported(format!(
                "volume {} already belongs to consistency group {existing}",
                volume.label
            )));
        }
        let snapshots = self.store.snapshot_count(&volume.id)?;
        if snapshots > 0 {
            return Err(LifecycleError::not_supported(format!(
                "volume {} has {snapshots} snapshots",
                volume.label
            )));
        }
        Ok(change_request(volume, pool, consistency_group.clone()))
    }

    fn dual_active_request(
        &self,
        volumes: &[Volume],
        pool: &VirtualPool,
    ) -> Result<VolumeRequest, LifecycleError<C::Error>> {
        let volume = single(volumes)?;
        let protected = volume.personality == Personality::Source && volume.protection_system.is_some();
        let dual_active = pool
            .protection
            .as_ref()
            .is_some_and(|protection| protection.dual_active);
        if !protected || !dual_active {
            return Err(LifecycleError::not_supported(format!(
                "upgrading {} to dual-active needs a protected source and a dual-active pool",
                volume.label
            )));
        }
        let group = volume.consistency_group.clone().ok_or_else(|| {
            LifecycleError::topology(format!(
                "protected source {} has no consistency group",
                volume.label
            ))
        })?;
        Ok(change_request(volume, pool, group))
    }

    async fn schedule_and_create(
        &self,
        request: &VolumeRequest,
        task: &TaskId,
    ) -> Result<TaskList, OperationFailure<C::Error>> {
        let proposals = self
            .scheduler
            .schedule_storage(&PlacementCriteria::from_request(request))
            .map_err(LifecycleError::<C::Error>::from)?;
        if proposals.is_empty() {
            return Err(LifecycleError::<C::Error>::PlacementExhausted.into());
        }
        self.create_volumes(request, &proposals, task).await
    }

    fn copy_mode_descriptors(
        &self,
        volumes: &[Volume],
        pool: &VirtualPool,
        mode: CopyMode,
    ) -> Result<Vec<VolumeDescriptor>, LifecycleError<C::Error>> {
        let group_id = shared_group(volumes)?;
        let group = self.store.require_consistency_group(group_id)?;
        if group.protection_system.is_none() {
            return Err(LifecycleError::not_supported(format!(
                "consistency group {} is not protected",
                group.label
            )));
        }
        Ok(volumes
            .iter()
            .map(|volume| {
                VolumeDescriptor::for_volume(
                    DescriptorAction::ExistingReuse,
                    DescriptorKind::ExistingProtectedSource,
                    volume,
                    volume.capacity,
                )
                .with_param(DescriptorParam::CopyMode, mode.name())
                .with_param(DescriptorParam::OldVirtualPool, volume.virtual_pool.as_str())
                .with_param(DescriptorParam::NewVirtualPool, pool.id.as_str())
            })
            .collect())
    }

    fn remove_protection_descriptors(
        &self,
        volumes: &[Volume],
        pool: &VirtualPool,
    ) -> Result<Vec<VolumeDescriptor>, LifecycleError<C::Error>> {
        if let Some(other) = volumes.iter().find(|volume| {
            volume.personality != Personality::Source || volume.protection_system.is_none()
        }) {
            return Err(LifecycleError::not_supported(format!(
                "protection can only be removed from protected sources; {} is not one",
                other.label
            )));
        }
        let set = self.deletion_set(volumes)?;
        let mut descriptors: Vec<VolumeDescriptor> = set
            .descriptors()
            .into_iter()
            .filter(|descriptor| descriptor.personality != Personality::Source)
            .collect();
        descriptors.extend(volumes.iter().map(|volume| {
            VolumeDescriptor::for_volume(
                DescriptorAction::ExistingReuse,
                DescriptorKind::ExistingProtectedSource,
                volume,
                volume.capacity,
            )
            .with_param(DescriptorParam::OldVirtualPool, volume.virtual_pool.as_str())
            .with_param(DescriptorParam::NewVirtualPool, pool.id.as_str())
        }));
        Ok(descriptors)
    }

    async fn submit_change(
        &self,
        descriptors: &[VolumeDescriptor],
        volumes: &[VolumeId],
        task: &TaskId,
    ) -> Result<TaskList, OperationFailure<C::Error>> {
        let tasks = self.create_tasks(volumes, OperationKind::ChangeVirtualPool, task)?;
        if let Err(source) = self.controller.change_virtual_pool(descriptors, task).await {
            let primary = LifecycleError::ControllerSubmission {
                operation: OperationKind::ChangeVirtualPool,
                source,
            };
            let mut failures = Vec::new();
            self.fail_tasks(&tasks, task, &primary.to_string(), &mut failures);
            return Err(Self::finish(primary, failures));
        }
        Ok(tasks)
    }
}

fn single<E>(volumes: &[Volume]) -> Result<&Volume, LifecycleError<E>>
where
    E: std::error::Error + 'static,
{
    match volumes {
        [volume] => Ok(volume),
        _ => Err(LifecycleError::not_supported(
            "the change applies to one volume at a time",
        )),
    }
}

fn shared_group<E>(volumes: &[Volume]) -> Result<&ConsistencyGroupId, LifecycleError<E>>
where
    E: std::error::Error + 'static,
{
    let mut groups = volumes.iter().map(|volume| volume.consistency_group.as_ref());
    let first = groups.next().flatten().ok_or_else(|| {
        LifecycleError::not_supported("copy mode changes need volumes in a consistency group")
    })?;
    if groups.any(|group| group != Some(first)) {
        return Err(LifecycleError::not_supported(
            "copy mode changes need every volume in the same consistency group",
        ));
    }
    Ok(first)
}

fn change_request(
    volume: &Volume,
    pool: &VirtualPool,
    consistency_group: ConsistencyGroupId,
) -> VolumeRequest {
    VolumeRequest {
        name: volume.label.clone(),
        size_bytes: volume.capacity,
        count: 1,
        virtual_pool: pool.id.clone(),
        virtual_array: volume.virtual_array.clone(),
        project: volume.project.clone(),
        consistency_group: Some(consistency_group),
        change_source: Some(volume.id.clone()),
    }
}
