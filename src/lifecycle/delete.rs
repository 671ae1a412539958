//! Deleting volumes together with their replication set.

use std::collections::BTreeSet;

use tracing::info;

use super::{LifecycleError, LifecycleOrchestrator, OperationFailure};
use crate::controller::OrchestrationController;
use crate::descriptor::{DescriptorAction, DescriptorKind, VolumeDescriptor};
use crate::lock::NamedLockService;
use crate::model::{Personality, TaskId, Volume, VolumeId};
use crate::scheduler::Scheduler;
use crate::store::VolumeStore;
use crate::task::{OperationKind, TaskList, TaskTracker};

/// Volumes a deletion removes, by role.
#[derive(Default)]
pub(super) struct DeletionSet {
    seen: BTreeSet<VolumeId>,
    targets: Vec<Volume>,
    sources: Vec<Volume>,
    journals: Vec<Volume>,
}

impl DeletionSet {
    fn insert(&mut self, volume: Volume) {
        if !self.seen.insert(volume.id.clone()) {
            return;
        }
        match volume.personality {
            Personality::Target => self.targets.push(volume),
            Personality::Metadata => self.journals.push(volume),
            Personality::Source | Personality::Plain => self.sources.push(volume),
        }
    }

    pub(super) fn descriptors(&self) -> Vec<VolumeDescriptor> {
        self.targets
            .iter()
            .chain(&self.sources)
            .chain(&self.journals)
            .map(delete_descriptor)
            .collect()
    }
}

impl<S, C, T, L, P> LifecycleOrchestrator<S, C, T, L, P>
where
    S: VolumeStore,
    C: OrchestrationController,
    T: TaskTracker,
    L: NamedLockService,
    P: Scheduler,
{
    /// Deletes `volumes` and everything that only exists to protect them.
    ///
    /// Sources bring their targets. Journals of a consistency group are
    /// deleted once every source of the group is part of the request. The
    /// batch is ordered targets, then sources, then journals, and one task
    /// is created per requested volume.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotSupported`] when a target is named
    /// directly, and [`LifecycleError::ControllerSubmission`] when the
    /// controller rejects the batch, after every task is marked errored.
    pub async fn delete_volumes(
        &self,
        volumes: &[VolumeId],
        task: &TaskId,
    ) -> Result<TaskList, OperationFailure<C::Error>> {
        let requested = self
            .store
            .require_volumes(volumes)
            .map_err(LifecycleError::<C::Error>::from)?;
        if let Some(target) = requested
            .iter()
            .find(|volume| volume.personality == Personality::Target)
        {
            return Err(LifecycleError::<C::Error>::not_supported(format!(
                "target {} can only be deleted through its source",
                target.label
            ))
            .into());
        }
        let set = self.deletion_set(&requested)?;
        let descriptors = set.descriptors();
        let tasks = self.create_tasks(volumes, OperationKind::DeleteVolume, task)?;
        info!(
            task = %task,
            requested = volumes.len(),
            descriptors = descriptors.len(),
            "submitting deletion"
        );
        if let Err(source) = self.controller.delete_volumes(&descriptors, task).await {
            let primary = LifecycleError::ControllerSubmission {
                operation: OperationKind::DeleteVolume,
                source,
            };
            let mut failures = Vec::new();
            self.fail_tasks(&tasks, task, &primary.to_string(), &mut failures);
            return Err(Self::finish(primary, failures));
        }
        Ok(tasks)
    }

    pub(super) fn deletion_set(&self, requested: &[Volume]) -> Result<DeletionSet, LifecycleError<C::Error>> {
        let mut set = DeletionSet::default();
        let mut groups = BTreeSet::new();
        for volume in requested {
            for target in self.store.require_volumes(&volume.protection_targets)? {
                set.insert(target);
            }
            if volume.protection_system.is_some()
                && let Some(group) = &volume.consistency_group
            {
                groups.insert(group.clone());
            }
            set.insert(volume.clone());
        }
        for group in &groups {
            let members = self.store.volumes_in_consistency_group(group)?;
            let last_sources = members
                .iter()
                .filter(|member| member.personality == Personality::Source)
                .all(|source| set.seen.contains(&source.id));
            if !last_sources {
                continue;
            }
            for journal in members
                .into_iter()
                .filter(|member| member.personality == Personality::Metadata)
            {
                set.insert(journal);
            }
        }
        Ok(set)
    }
}

fn delete_descriptor(volume: &Volume) -> VolumeDescriptor {
    let composed = volume.is_composed();
    let kind = match volume.personality {
        Personality::Target if composed => DescriptorKind::VirtualTarget,
        Personality::Target => DescriptorKind::ProtectedTarget,
        Personality::Metadata if composed => DescriptorKind::VirtualJournal,
        Personality::Metadata => DescriptorKind::Journal,
        Personality::Source if composed => DescriptorKind::VirtualSource,
        Personality::Source => DescriptorKind::ProtectedSource,
        Personality::Plain if composed => DescriptorKind::VirtualVolume,
        Personality::Plain => DescriptorKind::ArrayVolume,
    };
    VolumeDescriptor::for_volume(DescriptorAction::Delete, kind, volume, volume.capacity)
}
