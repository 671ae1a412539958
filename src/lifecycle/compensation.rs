//! Undoing the side effects of a failed request.

use tracing::{error, warn};

use super::{CompensationFailure, CompensationStep, LifecycleError, LifecycleOrchestrator, OperationFailure};
use crate::compiler::ProvisionLedger;
use crate::controller::OrchestrationController;
use crate::lock::NamedLockService;
use crate::model::TaskId;
use crate::scheduler::Scheduler;
use crate::store::VolumeStore;
use crate::task::{TaskList, TaskTracker};

impl<S, C, T, L, P> LifecycleOrchestrator<S, C, T, L, P>
where
    S: VolumeStore,
    C: OrchestrationController,
    T: TaskTracker,
    L: NamedLockService,
    P: Scheduler,
{
    /// Restores updated records, marks created records for deletion and
    /// fails the request's tasks. Every step is attempted; the ones that
    /// fail are collected next to `primary`.
    pub(super) fn compensate(
        &self,
        primary: LifecycleError<C::Error>,
        ledger: &ProvisionLedger,
        tasks: &TaskList,
        task: &TaskId,
    ) -> OperationFailure<C::Error> {
        warn!(task = %task, error = %primary, "rolling back failed request");
        let mut failures = Vec::new();
        for original in ledger.originals() {
            if let Err(err) = self.store.update_volume(original) {
                failures.push(CompensationFailure {
                    step: CompensationStep::RestoreRecord,
                    entity: original.id.to_string(),
                    message: err.to_string(),
                });
            }
        }
        for created in ledger.created() {
            if let Err(err) = self.store.mark_for_deletion(created) {
                failures.push(CompensationFailure {
                    step: CompensationStep::DeleteVolume,
                    entity: created.to_string(),
                    message: err.to_string(),
                });
            }
        }
        self.fail_tasks(tasks, task, &primary.to_string(), &mut failures);
        Self::finish(primary, failures)
    }

    /// Forces every task in `tasks` into the error state with `message`.
    pub(super) fn fail_tasks(
        &self,
        tasks: &TaskList,
        task: &TaskId,
        message: &str,
        failures: &mut Vec<CompensationFailure>,
    ) {
        for volume in tasks.volumes() {
            if let Err(err) = self.tracker.mark_error(&volume, task, message) {
                failures.push(CompensationFailure {
                    step: CompensationStep::MarkTaskError,
                    entity: volume.to_string(),
                    message: err.to_string(),
                });
            }
        }
    }

    pub(super) fn finish(
        primary: LifecycleError<C::Error>,
        failures: Vec<CompensationFailure>,
    ) -> OperationFailure<C::Error> {
        for failure in &failures {
            error!(step = failure.step.name(), entity = %failure.entity, "{}", failure.message);
        }
        OperationFailure::new(primary, failures)
    }
}
