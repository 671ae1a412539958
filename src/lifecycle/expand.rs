//! Expanding a protected replication set.

use tracing::{debug, info, warn};

use super::{CompensationFailure, CompensationStep, LifecycleError, LifecycleOrchestrator, OperationFailure};
use crate::capacity::{CapacityReconciler, ReconcileRequest};
use crate::controller::OrchestrationController;
use crate::descriptor::{DescriptorAction, DescriptorKind, VolumeDescriptor};
use crate::lock::NamedLockService;
use crate::model::{Personality, TaskId, Volume, VolumeId};
use crate::request::RequestError;
use crate::scheduler::Scheduler;
use crate::store::VolumeStore;
use crate::task::{OperationKind, TaskList, TaskTracker};

/// Pre-expand state of one replication set member.
struct Participant {
    original: Volume,
    capacity: u64,
}

impl<S, C, T, L, P> LifecycleOrchestrator<S, C, T, L, P>
where
    S: VolumeStore,
    C: OrchestrationController,
    T: TaskTracker,
    L: NamedLockService,
    P: Scheduler,
{
    /// Grows the protected source `volume` and its targets to `new_size`.
    ///
    /// The size is first rounded up to the meta-member unit of any
    /// cylinder-addressed participant, then reconciled across families.
    /// Tracked capacities are written only once the controller accepts the
    /// batch. When the controller rejects it, each participant's observed capacity
    /// is queried: participants still at their original size are restored,
    /// and participants the controller reports as grown keep the observed
    /// size with a [`CompensationStep::PartialExpansion`] entry.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTopology`] when `volume` is not a
    /// protected source with targets at least as large as itself,
    /// [`LifecycleError::Request`] when `new_size` does not grow the volume,
    /// and [`LifecycleError::ControllerSubmission`] when the controller
    /// rejects the batch.
    pub async fn expand_volume(
        &self,
        volume: &VolumeId,
        new_size: u64,
        task: &TaskId,
    ) -> Result<TaskList, OperationFailure<C::Error>> {
        let source = self.store.require_volume(volume).map_err(LifecycleError::<C::Error>::from)?;
        let targets = self.verify_expandable(&source, new_size)?;
        let members: Vec<VolumeId> = std::iter::once(source.id.clone())
            .chain(targets.iter().map(|target| target.id.clone()))
            .collect();

        let rounded = self.meta_rounded_size(&source, &targets, new_size)?;
        let reconciler = CapacityReconciler::new(
            &self.store,
            &self.calculators,
            self.settings.target_skew_bytes,
        );
        let plan = reconciler
            .reconcile(&ReconcileRequest::new(&members, rounded).expand())
            .map_err(LifecycleError::<C::Error>::from)?
            .plan();
        info!(volume = %source.id, requested = new_size, ?plan, "expanding replication set");

        let participants: Vec<Participant> = std::iter::once(source)
            .chain(targets)
            .map(|original| Participant {
                capacity: plan.capacity_for(original.personality),
                original,
            })
            .collect();
        let tasks = self
            .create_tasks(std::slice::from_ref(volume), OperationKind::ExpandVolume, task)?;

        let descriptors = participants
            .iter()
            .map(|participant| expand_descriptor(&participant.original, participant.capacity))
            .collect::<Vec<_>>();
        match self
            .controller
            .expand_volume(&descriptors, rounded, task)
            .await
        {
            Ok(()) => match self.track_expansion(&participants) {
                Ok(()) => Ok(tasks),
                Err(primary) => {
                    let mut failures = Vec::new();
                    self.fail_tasks(&tasks, task, &primary.to_string(), &mut failures);
                    Err(Self::finish(primary, failures))
                }
            },
            Err(source) => {
                let primary = LifecycleError::ControllerSubmission {
                    operation: OperationKind::ExpandVolume,
                    source,
                };
                Err(self.restore_expansion(primary, &participants, &tasks, task).await)
            }
        }
    }

    fn verify_expandable(
        &self,
        source: &Volume,
        new_size: u64,
    ) -> Result<Vec<Volume>, LifecycleError<C::Error>> {
        if source.personality != Personality::Source || source.protection_system.is_none() {
            return Err(LifecycleError::topology(format!(
                "volume {} is not a protected source",
                source.label
            )));
        }
        if source.protection_targets.is_empty() {
            return Err(LifecycleError::topology(format!(
                "protected source {} has no targets",
                source.label
            )));
        }
        if new_size <= source.capacity {
            return Err(RequestError::OutOfRange {
                field: "size_bytes",
                message: format!(
                    "new size {new_size} must exceed the current size {}",
                    source.capacity
                ),
            }
            .into());
        }
        let targets = self.store.require_volumes(&source.protection_targets)?;
        if let Some(small) = targets.iter().find(|target| target.capacity < source.capacity) {
            return Err(LifecycleError::topology(format!(
                "target {} ({} bytes) is smaller than its source {} ({} bytes)",
                small.label, small.capacity, source.label, source.capacity
            )));
        }
        Ok(targets)
    }

    /// Rounds `new_size` up to the largest meta-member unit among the
    /// participants and their backing legs.
    fn meta_rounded_size(
        &self,
        source: &Volume,
        targets: &[Volume],
        new_size: u64,
    ) -> Result<u64, LifecycleError<C::Error>> {
        let mut placed = Vec::new();
        for volume in std::iter::once(source).chain(targets) {
            if volume.is_composed() {
                placed.extend(self.store.require_volumes(&volume.backing_volumes)?);
            } else {
                placed.push(volume.clone());
            }
        }
        let mut rounded = new_size;
        for volume in &placed {
            let Some(system_id) = &volume.storage_system else {
                continue;
            };
            let family = self.store.require_storage_system(system_id)?.family;
            let Some(unit) = self.calculators.calculator(family).meta_member_unit() else {
                continue;
            };
            let candidate = new_size.checked_next_multiple_of(unit).ok_or_else(|| {
                LifecycleError::Request(RequestError::OutOfRange {
                    field: "size_bytes",
                    message: format!("new size {new_size} overflows when rounded to {unit} bytes"),
                })
            })?;
            if candidate > rounded {
                debug!(volume = %volume.id, family = family.name(), candidate, "meta-member rounding");
                rounded = candidate;
            }
        }
        Ok(rounded)
    }

    fn track_expansion(&self, participants: &[Participant]) -> Result<(), LifecycleError<C::Error>> {
        for participant in participants {
            let mut record = participant.original.clone();
            record.capacity = participant.capacity;
            self.store.update_volume(&record)?;
        }
        Ok(())
    }

    async fn restore_expansion(
        &self,
        primary: LifecycleError<C::Error>,
        participants: &[Participant],
        tasks: &TaskList,
        task: &TaskId,
    ) -> OperationFailure<C::Error> {
        warn!(task = %task, error = %primary, "restoring capacities after failed expansion");
        let mut failures = Vec::new();
        for participant in participants {
            let original = &participant.original;
            match self.controller.observed_capacity(&original.id).await {
                Ok(Some(observed)) if observed > original.capacity => {
                    failures.push(self.keep_observed(original, observed));
                    continue;
                }
                Ok(_) => {}
                Err(err) => failures.push(CompensationFailure {
                    step: CompensationStep::RestoreCapacity,
                    entity: original.id.to_string(),
                    message: format!("observed capacity unavailable, restoring anyway: {err}"),
                }),
            }
            if let Err(err) = self.store.update_volume(original) {
                failures.push(CompensationFailure {
                    step: CompensationStep::RestoreCapacity,
                    entity: original.id.to_string(),
                    message: err.to_string(),
                });
            }
        }
        self.fail_tasks(tasks, task, &primary.to_string(), &mut failures);
        Self::finish(primary, failures)
    }

    fn keep_observed(&self, original: &Volume, observed: u64) -> CompensationFailure {
        let mut record = original.clone();
        record.capacity = observed;
        let message = match self.store.update_volume(&record) {
            Ok(()) => format!(
                "controller reports {observed} bytes against an original {}; observed size kept",
                original.capacity
            ),
            Err(err) => format!(
                "controller reports {observed} bytes against an original {}; recording it failed: {err}",
                original.capacity
            ),
        };
        CompensationFailure {
            step: CompensationStep::PartialExpansion,
            entity: original.id.to_string(),
            message,
        }
    }
}

fn expand_descriptor(volume: &Volume, capacity: u64) -> VolumeDescriptor {
    let kind = match (volume.personality, volume.is_composed()) {
        (Personality::Target, true) => DescriptorKind::VirtualTarget,
        (Personality::Target, false) => DescriptorKind::ProtectedTarget,
        (_, true) => DescriptorKind::VirtualSource,
        (_, false) => DescriptorKind::ProtectedSource,
    };
    VolumeDescriptor::for_volume(DescriptorAction::Expand, kind, volume, capacity)
}
