//! Unit tests for lifecycle orchestration.

use rstest::rstest;

use super::*;
use crate::controller::{Submission, SubmissionKind};
use crate::descriptor::{DescriptorAction, DescriptorParam};
use crate::lock::InProcessLockService;
use crate::migration::MigrationTarget;
use crate::model::CopyMode;
use crate::store::InMemoryStore;
use crate::task::{InMemoryTaskTracker, TaskStatus};
use crate::test_support::{
    BRONZE, ControllerFailure, EAST, EAST_ARRAY, FaultyStore, GIB, GOLD, GROUP, ScriptedController,
    WEST, placement, plain_proposal, protected_proposal, request, seed_plain_volume,
    seed_protected_set, topology,
};
use crate::scheduler::StaticScheduler;

type Orchestrator<S> = LifecycleOrchestrator<
    S,
    ScriptedController,
    InMemoryTaskTracker,
    InProcessLockService,
    StaticScheduler,
>;

const CURRENT_CYLINDER_BYTES: u64 = 1_966_080;

fn orchestrator<S: VolumeStore>(
    store: S,
    controller: &ScriptedController,
    tracker: &InMemoryTaskTracker,
    proposals: Vec<Proposal>,
) -> Orchestrator<S> {
    LifecycleOrchestrator::new(
        store,
        controller.clone(),
        tracker.clone(),
        InProcessLockService::new(),
        StaticScheduler::new(proposals),
    )
}

fn task() -> TaskId {
    TaskId::new("task-1")
}

fn stored(store: &InMemoryStore, id: &VolumeId) -> Volume {
    store
        .require_volume(id)
        .unwrap_or_else(|err| panic!("volume {id} should exist: {err}"))
}

fn only_submission(controller: &ScriptedController) -> Submission {
    let mut submissions = controller.submissions();
    assert_eq!(submissions.len(), 1, "expected exactly one batch");
    submissions
        .pop()
        .unwrap_or_else(|| panic!("a submission was recorded"))
}

fn errored_tasks(tracker: &InMemoryTaskTracker) -> usize {
    tracker
        .tasks()
        .unwrap_or_else(|err| panic!("tracker should be readable: {err}"))
        .iter()
        .filter(|entry| matches!(entry.status, TaskStatus::Error { .. }))
        .count()
}

fn personalities(submission: &Submission) -> Vec<Personality> {
    submission
        .descriptors
        .iter()
        .map(|descriptor| descriptor.personality)
        .collect()
}

#[tokio::test]
async fn protected_create_submits_one_batch_and_tracks_the_source() {
    let store = topology();
    let controller = ScriptedController::new();
    let tracker = InMemoryTaskTracker::new();
    let lifecycle = orchestrator(store.clone(), &controller, &tracker, Vec::new());

    let tasks = lifecycle
        .create_volumes(&request(GOLD, 1, 100 * GIB), &[protected_proposal(1, 100 * GIB)], &task())
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(tasks.len(), 1);
    let batch = only_submission(&controller);
    assert_eq!(batch.kind, SubmissionKind::Create);
    assert_eq!(
        personalities(&batch),
        vec![
            Personality::Metadata,
            Personality::Metadata,
            Personality::Source,
            Personality::Target,
        ]
    );
    assert_eq!(errored_tasks(&tracker), 0);
}

#[tokio::test]
async fn rejected_create_deletes_every_created_record_and_fails_tasks() {
    let store = topology();
    let controller = ScriptedController::new().failing(ControllerFailure::Create);
    let tracker = InMemoryTaskTracker::new();
    let lifecycle = orchestrator(store.clone(), &controller, &tracker, Vec::new());

    let failure = lifecycle
        .create_volumes(&request(GOLD, 2, 10 * GIB), &[protected_proposal(2, 10 * GIB)], &task())
        .await
        .expect_err("controller rejection should fail the request");

    assert!(matches!(
        failure.primary(),
        LifecycleError::ControllerSubmission {
            operation: OperationKind::CreateVolume,
            ..
        }
    ));
    assert!(failure.compensations().is_empty());
    let inactive = store
        .inactive_volumes()
        .unwrap_or_else(|err| panic!("store should be readable: {err}"));
    assert_eq!(inactive.len(), 6, "two journals, two sources and two targets");
    assert_eq!(errored_tasks(&tracker), 2);
}

#[tokio::test]
async fn failed_compensation_is_reported_next_to_the_primary_error() {
    let store = FaultyStore::new(topology());
    store.fail_deletions();
    let controller = ScriptedController::new().failing(ControllerFailure::Create);
    let tracker = InMemoryTaskTracker::new();
    let lifecycle = orchestrator(store, &controller, &tracker, Vec::new());

    let failure = lifecycle
        .create_volumes(&request(BRONZE, 1, 10 * GIB), &[plain_proposal(1, 10 * GIB)], &task())
        .await
        .expect_err("controller rejection should fail the request");

    assert!(matches!(
        failure.primary(),
        LifecycleError::ControllerSubmission { .. }
    ));
    let steps: Vec<CompensationStep> = failure
        .compensations()
        .iter()
        .map(|entry| entry.step)
        .collect();
    assert_eq!(steps, vec![CompensationStep::DeleteVolume]);
    assert!(failure.to_string().contains("compensation also failed"));
    assert_eq!(errored_tasks(&tracker), 1);
}

#[tokio::test]
async fn invalid_requests_fail_before_any_side_effect() {
    let store = topology();
    let controller = ScriptedController::new();
    let tracker = InMemoryTaskTracker::new();
    let lifecycle = orchestrator(store.clone(), &controller, &tracker, Vec::new());
    let mut invalid = request(BRONZE, 1, 10 * GIB);
    invalid.count = 0;

    let failure = lifecycle
        .create_volumes(&invalid, &[plain_proposal(1, 10 * GIB)], &task())
        .await
        .expect_err("zero count should be rejected");

    assert!(matches!(failure.primary(), LifecycleError::Request(_)));
    assert!(controller.submissions().is_empty());
    let active = store
        .active_volumes_where(|_| true)
        .unwrap_or_else(|err| panic!("store should be readable: {err}"));
    assert!(active.is_empty());
}

#[tokio::test]
async fn rejected_protection_change_restores_the_original_volume() {
    let store = topology();
    let legacy = seed_plain_volume(&store, 50 * GIB);
    let original = stored(&store, &legacy);
    let controller = ScriptedController::new().failing(ControllerFailure::ChangeVirtualPool);
    let tracker = InMemoryTaskTracker::new();
    let lifecycle = orchestrator(
        store.clone(),
        &controller,
        &tracker,
        vec![protected_proposal(1, 50 * GIB)],
    );
    let change = TierChangeRequest {
        volumes: vec![legacy.clone()],
        new_virtual_pool: GOLD.into(),
        change: TierChange::AddProtection {
            consistency_group: GROUP.into(),
        },
    };

    let failure = lifecycle
        .change_virtual_pool(&change, &task())
        .await
        .expect_err("controller rejection should fail the change");

    assert!(matches!(
        failure.primary(),
        LifecycleError::ControllerSubmission {
            operation: OperationKind::ChangeVirtualPool,
            ..
        }
    ));
    assert_eq!(stored(&store, &legacy), original);
    let inactive = store
        .inactive_volumes()
        .unwrap_or_else(|err| panic!("store should be readable: {err}"));
    assert!(!inactive.contains(&legacy));
    assert_eq!(inactive.len(), 3, "two journals and the target are withdrawn");
}

#[tokio::test]
async fn protection_is_not_added_to_volumes_with_snapshots() {
    let store = topology();
    let legacy = seed_plain_volume(&store, 50 * GIB);
    store
        .set_snapshot_count(&legacy, 2)
        .unwrap_or_else(|err| panic!("snapshot count should be stored: {err}"));
    let controller = ScriptedController::new();
    let lifecycle = orchestrator(
        store,
        &controller,
        &InMemoryTaskTracker::new(),
        vec![protected_proposal(1, 50 * GIB)],
    );
    let change = TierChangeRequest {
        volumes: vec![legacy],
        new_virtual_pool: GOLD.into(),
        change: TierChange::AddProtection {
            consistency_group: GROUP.into(),
        },
    };

    let failure = lifecycle
        .change_virtual_pool(&change, &task())
        .await
        .expect_err("snapshots block protection");

    assert!(matches!(failure.primary(), LifecycleError::NotSupported { .. }));
    assert!(controller.submissions().is_empty());
}

#[tokio::test]
async fn protection_needs_a_scheduler_placement() {
    let store = topology();
    let legacy = seed_plain_volume(&store, 50 * GIB);
    let lifecycle = orchestrator(
        store,
        &ScriptedController::new(),
        &InMemoryTaskTracker::new(),
        Vec::new(),
    );
    let change = TierChangeRequest {
        volumes: vec![legacy],
        new_virtual_pool: GOLD.into(),
        change: TierChange::AddProtection {
            consistency_group: GROUP.into(),
        },
    };

    let failure = lifecycle
        .change_virtual_pool(&change, &task())
        .await
        .expect_err("no placement should fail");

    assert!(matches!(failure.primary(), LifecycleError::PlacementExhausted));
}

#[tokio::test]
async fn single_volume_changes_reject_several_volumes() {
    let store = topology();
    let set = seed_protected_set(&store, 100 * GIB, 50 * GIB);
    let legacy = seed_plain_volume(&store, 50 * GIB);
    let lifecycle = orchestrator(
        store,
        &ScriptedController::new(),
        &InMemoryTaskTracker::new(),
        Vec::new(),
    );
    let change = TierChangeRequest {
        volumes: vec![set.source, legacy],
        new_virtual_pool: GOLD.into(),
        change: TierChange::UpgradeToDualActive,
    };

    let failure = lifecycle
        .change_virtual_pool(&change, &task())
        .await
        .expect_err("dual-active upgrades take one volume");

    assert!(matches!(failure.primary(), LifecycleError::NotSupported { .. }));
}

#[tokio::test]
async fn copy_mode_changes_are_submitted_for_the_whole_group() {
    let store = topology();
    let set = seed_protected_set(&store, 100 * GIB, 50 * GIB);
    let controller = ScriptedController::new();
    let tracker = InMemoryTaskTracker::new();
    let lifecycle = orchestrator(store, &controller, &tracker, Vec::new());
    let change = TierChangeRequest {
        volumes: vec![set.source.clone()],
        new_virtual_pool: GOLD.into(),
        change: TierChange::ChangeCopyMode {
            mode: CopyMode::Synchronous,
        },
    };

    let tasks = lifecycle
        .change_virtual_pool(&change, &task())
        .await
        .unwrap_or_else(|err| panic!("copy mode change should succeed: {err}"));

    assert_eq!(tasks.volumes(), vec![set.source]);
    let batch = only_submission(&controller);
    assert_eq!(batch.kind, SubmissionKind::ChangeVirtualPool);
    let [descriptor] = batch.descriptors.as_slice() else {
        panic!("expected one descriptor, got {}", batch.descriptors.len());
    };
    assert_eq!(descriptor.action, DescriptorAction::ExistingReuse);
    assert_eq!(descriptor.param(DescriptorParam::CopyMode), Some("synchronous"));
}

#[tokio::test]
async fn removing_protection_deletes_targets_and_journals_and_keeps_the_source() {
    let store = topology();
    let set = seed_protected_set(&store, 100 * GIB, 50 * GIB);
    let controller = ScriptedController::new();
    let lifecycle = orchestrator(store, &controller, &InMemoryTaskTracker::new(), Vec::new());
    let change = TierChangeRequest {
        volumes: vec![set.source.clone()],
        new_virtual_pool: BRONZE.into(),
        change: TierChange::RemoveProtection,
    };

    lifecycle
        .change_virtual_pool(&change, &task())
        .await
        .unwrap_or_else(|err| panic!("protection removal should succeed: {err}"));

    let batch = only_submission(&controller);
    let actions: Vec<(DescriptorAction, Personality)> = batch
        .descriptors
        .iter()
        .map(|descriptor| (descriptor.action, descriptor.personality))
        .collect();
    assert_eq!(
        actions,
        vec![
            (DescriptorAction::Delete, Personality::Target),
            (DescriptorAction::Delete, Personality::Metadata),
            (DescriptorAction::Delete, Personality::Metadata),
            (DescriptorAction::ExistingReuse, Personality::Source),
        ]
    );
    assert!(
        batch
            .descriptors
            .last()
            .is_some_and(|descriptor| descriptor.volume == set.source)
    );
}

#[tokio::test]
async fn ungrouped_volumes_migrate_on_their_own() {
    let store = topology();
    let legacy = seed_plain_volume(&store, 50 * GIB);
    let controller = ScriptedController::new();
    let lifecycle = orchestrator(store, &controller, &InMemoryTaskTracker::new(), Vec::new());
    let change = TierChangeRequest {
        volumes: vec![legacy.clone()],
        new_virtual_pool: GOLD.into(),
        change: TierChange::DataMigration {
            migrations: vec![MigrationTarget {
                volume: legacy.clone(),
                target: placement(EAST, GOLD, EAST_ARRAY),
            }],
        },
    };

    lifecycle
        .change_virtual_pool(&change, &task())
        .await
        .unwrap_or_else(|err| panic!("migration should succeed: {err}"));

    let batch = only_submission(&controller);
    let [descriptor] = batch.descriptors.as_slice() else {
        panic!("expected one descriptor, got {}", batch.descriptors.len());
    };
    assert_eq!(descriptor.action, DescriptorAction::Migrate);
    assert_eq!(descriptor.volume, legacy);
    assert_eq!(descriptor.param(DescriptorParam::OldVirtualPool), Some(BRONZE));
}

#[tokio::test]
async fn expansion_rounds_to_the_cylinder_unit_and_tracks_every_copy_once_accepted() {
    let store = topology();
    let set = seed_protected_set(&store, 100 * GIB, 50 * GIB);
    let controller = ScriptedController::new();
    controller.watch_capacities(&store, &[set.source.clone(), set.target.clone()]);
    let lifecycle = orchestrator(store.clone(), &controller, &InMemoryTaskTracker::new(), Vec::new());
    let expected = (101 * GIB).next_multiple_of(CURRENT_CYLINDER_BYTES);

    let tasks = lifecycle
        .expand_volume(&set.source, 101 * GIB, &task())
        .await
        .unwrap_or_else(|err| panic!("expand should succeed: {err}"));

    assert_eq!(tasks.volumes(), vec![set.source.clone()]);
    assert!(expected > 101 * GIB);
    assert_eq!(
        controller.witnessed_capacities(),
        vec![(set.source.clone(), 100 * GIB), (set.target.clone(), 100 * GIB)],
        "the store keeps the original size until the controller accepts the batch"
    );
    assert_eq!(stored(&store, &set.source).capacity, expected);
    assert_eq!(stored(&store, &set.target).capacity, expected);
    let batch = only_submission(&controller);
    assert_eq!(batch.kind, SubmissionKind::Expand);
    assert!(
        batch
            .descriptors
            .iter()
            .all(|descriptor| descriptor.action == DescriptorAction::Expand
                && descriptor.capacity == expected)
    );
}

#[tokio::test]
async fn rejected_expansion_restores_tracked_capacities() {
    let store = topology();
    let set = seed_protected_set(&store, 100 * GIB, 50 * GIB);
    let controller = ScriptedController::new().failing(ControllerFailure::Expand);
    let tracker = InMemoryTaskTracker::new();
    let lifecycle = orchestrator(store.clone(), &controller, &tracker, Vec::new());

    let failure = lifecycle
        .expand_volume(&set.source, 150 * GIB, &task())
        .await
        .expect_err("controller rejection should fail the expansion");

    assert!(failure.compensations().is_empty());
    assert_eq!(stored(&store, &set.source).capacity, 100 * GIB);
    assert_eq!(stored(&store, &set.target).capacity, 100 * GIB);
    assert_eq!(errored_tasks(&tracker), 1);
}

#[tokio::test]
async fn partly_applied_expansion_keeps_the_observed_size_and_says_so() {
    let store = topology();
    let set = seed_protected_set(&store, 100 * GIB, 50 * GIB);
    let controller = ScriptedController::new().failing(ControllerFailure::Expand);
    controller.observe(&set.target, 150 * GIB);
    let lifecycle = orchestrator(store.clone(), &controller, &InMemoryTaskTracker::new(), Vec::new());

    let failure = lifecycle
        .expand_volume(&set.source, 150 * GIB, &task())
        .await
        .expect_err("controller rejection should fail the expansion");

    assert_eq!(stored(&store, &set.source).capacity, 100 * GIB);
    assert_eq!(stored(&store, &set.target).capacity, 150 * GIB);
    let [partial] = failure.compensations() else {
        panic!("expected one compensation entry: {failure}");
    };
    assert_eq!(partial.step, CompensationStep::PartialExpansion);
    assert_eq!(partial.entity, set.target.as_str());
}

#[tokio::test]
async fn unknown_observed_capacity_still_restores_and_is_reported() {
    let store = topology();
    let set = seed_protected_set(&store, 100 * GIB, 50 * GIB);
    let controller = ScriptedController::new()
        .failing(ControllerFailure::Expand)
        .failing(ControllerFailure::ObservedCapacity);
    let lifecycle = orchestrator(store.clone(), &controller, &InMemoryTaskTracker::new(), Vec::new());

    let failure = lifecycle
        .expand_volume(&set.source, 150 * GIB, &task())
        .await
        .expect_err("controller rejection should fail the expansion");

    assert_eq!(stored(&store, &set.source).capacity, 100 * GIB);
    assert_eq!(failure.compensations().len(), 2);
    assert!(
        failure
            .compensations()
            .iter()
            .all(|entry| entry.step == CompensationStep::RestoreCapacity)
    );
}

#[rstest]
#[case::shrink(50 * GIB)]
#[case::same_size(100 * GIB)]
#[tokio::test]
async fn expansion_must_grow_the_volume(#[case] new_size: u64) {
    let store = topology();
    let set = seed_protected_set(&store, 100 * GIB, 50 * GIB);
    let controller = ScriptedController::new();
    let lifecycle = orchestrator(store, &controller, &InMemoryTaskTracker::new(), Vec::new());

    let failure = lifecycle
        .expand_volume(&set.source, new_size, &task())
        .await
        .expect_err("non-growing sizes are rejected");

    assert!(matches!(failure.primary(), LifecycleError::Request(_)));
    assert!(controller.submissions().is_empty());
}

#[tokio::test]
async fn unprotected_volumes_are_not_expanded_here() {
    let store = topology();
    let legacy = seed_plain_volume(&store, 50 * GIB);
    let lifecycle = orchestrator(
        store,
        &ScriptedController::new(),
        &InMemoryTaskTracker::new(),
        Vec::new(),
    );

    let failure = lifecycle
        .expand_volume(&legacy, 100 * GIB, &task())
        .await
        .expect_err("plain volumes are rejected");

    assert!(matches!(failure.primary(), LifecycleError::InvalidTopology { .. }));
}

#[tokio::test]
async fn deleting_the_last_source_removes_targets_then_source_then_journals() {
    let store = topology();
    let set = seed_protected_set(&store, 100 * GIB, 50 * GIB);
    let controller = ScriptedController::new();
    let lifecycle = orchestrator(store, &controller, &InMemoryTaskTracker::new(), Vec::new());

    let tasks = lifecycle
        .delete_volumes(&[set.source.clone()], &task())
        .await
        .unwrap_or_else(|err| panic!("delete should succeed: {err}"));

    assert_eq!(tasks.volumes(), vec![set.source]);
    let batch = only_submission(&controller);
    assert_eq!(batch.kind, SubmissionKind::Delete);
    assert_eq!(
        personalities(&batch),
        vec![
            Personality::Target,
            Personality::Source,
            Personality::Metadata,
            Personality::Metadata,
        ]
    );
}

#[tokio::test]
async fn targets_cannot_be_deleted_directly() {
    let store = topology();
    let set = seed_protected_set(&store, 100 * GIB, 50 * GIB);
    let controller = ScriptedController::new();
    let lifecycle = orchestrator(store, &controller, &InMemoryTaskTracker::new(), Vec::new());

    let failure = lifecycle
        .delete_volumes(&[set.target], &task())
        .await
        .expect_err("targets go through their source");

    assert!(matches!(failure.primary(), LifecycleError::NotSupported { .. }));
    assert!(controller.submissions().is_empty());
}

#[tokio::test]
async fn rejected_deletion_fails_every_task() {
    let store = topology();
    let legacy = seed_plain_volume(&store, 50 * GIB);
    let controller = ScriptedController::new().failing(ControllerFailure::Delete);
    let tracker = InMemoryTaskTracker::new();
    let lifecycle = orchestrator(store, &controller, &tracker, Vec::new());

    let failure = lifecycle
        .delete_volumes(&[legacy], &task())
        .await
        .expect_err("controller rejection should fail the deletion");

    assert!(matches!(
        failure.primary(),
        LifecycleError::ControllerSubmission {
            operation: OperationKind::DeleteVolume,
            ..
        }
    ));
    assert_eq!(errored_tasks(&tracker), 1);
}

fn target_journal_proposal() -> Proposal {
    match protected_proposal(1, 10 * GIB) {
        Proposal::Protected(mut protected) => {
            protected.source_journal = None;
            Proposal::Protected(protected)
        }
        other => other,
    }
}

#[tokio::test]
async fn journal_capacity_is_added_to_the_named_copy() {
    let store = topology();
    seed_protected_set(&store, 100 * GIB, 50 * GIB);
    let controller = ScriptedController::new();
    let scheduler = StaticScheduler::new(vec![target_journal_proposal()]);
    let lifecycle = LifecycleOrchestrator::new(
        store.clone(),
        controller.clone(),
        InMemoryTaskTracker::new(),
        InProcessLockService::new(),
        scheduler.clone(),
    );
    let addition = JournalCapacityRequest {
        consistency_group: GROUP.into(),
        copy_name: "WEST".to_owned(),
        virtual_pool: GOLD.into(),
        size_bytes: 10 * GIB,
        count: 1,
    };

    let tasks = lifecycle
        .add_journal_capacity(&addition, &task())
        .await
        .unwrap_or_else(|err| panic!("journal addition should succeed: {err}"));

    let [journal_task] = tasks.tasks() else {
        panic!("expected one task, got {}", tasks.len());
    };
    assert_eq!(journal_task.operation, OperationKind::AddJournalCapacity);
    let journal = stored(&store, &journal_task.volume);
    assert_eq!(journal.label, "WEST_task-1");
    assert_eq!(journal.personality, Personality::Metadata);
    assert_eq!(journal.capacity, 10 * GIB);
    assert_eq!(journal.virtual_array.as_str(), WEST);
    let criteria = scheduler
        .requests()
        .unwrap_or_else(|err| panic!("scheduler log should be readable: {err}"));
    assert!(criteria.iter().all(|entry| entry.virtual_array.as_str() == WEST));
    assert_eq!(personalities(&only_submission(&controller)), vec![Personality::Metadata]);
}

#[tokio::test]
async fn journal_capacity_needs_a_known_copy() {
    let store = topology();
    seed_protected_set(&store, 100 * GIB, 50 * GIB);
    let lifecycle = orchestrator(
        store,
        &ScriptedController::new(),
        &InMemoryTaskTracker::new(),
        vec![target_journal_proposal()],
    );
    let addition = JournalCapacityRequest {
        consistency_group: GROUP.into(),
        copy_name: "north".to_owned(),
        virtual_pool: GOLD.into(),
        size_bytes: 10 * GIB,
        count: 1,
    };

    let failure = lifecycle
        .add_journal_capacity(&addition, &task())
        .await
        .expect_err("unknown copies are rejected");

    assert!(matches!(
        failure.primary(),
        LifecycleError::InvalidTopology { reason } if reason.contains("north")
    ));
}
