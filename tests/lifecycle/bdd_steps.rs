//! BDD step definitions for the lifecycle orchestrator.

use ruslan::capacity::{CalculatorSet, CapacityPlan, CapacityReconciler, ReconcileRequest};
use ruslan::controller::SubmissionKind;
use ruslan::descriptor::{DescriptorKind, DescriptorParam, verify_creation_order};
use ruslan::migration::MigrationTarget;
use ruslan::model::{Personality, TaskId, VolumeId};
use ruslan::recommendation::Placement;
use ruslan::task::TaskStatus;
use ruslan::test_support::{
    ControllerFailure, EAST, GOLD, ScriptedController, protected_proposal, request,
    seed_protected_set,
};
use ruslan::{
    InMemoryStore, LifecycleOrchestrator, NamedLockService, StaticScheduler, Submission,
    TierChange, TierChangeRequest, VolumeStore,
};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{
    FailureKind, LOCK_TIMEOUT, LifecycleContext, LifecycleResult, LifecycleTestError,
    group_system, parse_family, placed_volume, seed_family_system,
};
use crate::size_constants::{BYTES_PER_GIB, BYTES_PER_MIB};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] LifecycleTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

type Orchestrator = LifecycleOrchestrator<
    InMemoryStore,
    ScriptedController,
    ruslan::InMemoryTaskTracker,
    ruslan::InProcessLockService,
    StaticScheduler,
>;

fn orchestrator(context: &LifecycleContext) -> Orchestrator {
    LifecycleOrchestrator::new(
        context.store.clone(),
        context.controller.clone(),
        context.tracker.clone(),
        context.locks.clone(),
        StaticScheduler::new(Vec::new()),
    )
    .with_settings(context.settings)
}

fn task() -> TaskId {
    TaskId::new("task-bdd")
}

fn runtime() -> Result<Runtime, StepError> {
    Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))
}

fn setup(err: impl std::fmt::Display) -> StepError {
    StepError::Setup(LifecycleTestError::Fixture(err.to_string()))
}

fn only_submission(context: &LifecycleContext) -> Result<Submission, StepError> {
    match context.controller.submissions().as_slice() {
        [batch] => Ok(batch.clone()),
        other => Err(StepError::Assertion(format!(
            "expected one batch, got {}",
            other.len()
        ))),
    }
}

fn pair(context: &LifecycleContext) -> Result<(VolumeId, VolumeId), StepError> {
    context
        .pair
        .clone()
        .ok_or_else(|| StepError::Assertion(String::from("no volume pair was seeded")))
}

fn plan(context: &LifecycleContext) -> Result<CapacityPlan, StepError> {
    context
        .plan
        .ok_or_else(|| StepError::Assertion(String::from("no reconciliation ran")))
}

fn family_rounding(family: &str, bytes: u64) -> Result<u64, StepError> {
    let calculators = CalculatorSet::new();
    Ok(calculators
        .calculator(parse_family(family)?)
        .allocated_capacity(bytes))
}

#[given("a fixture topology")]
fn fixture_topology(lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context
}

#[given("the controller rejects creations")]
fn controller_rejects_creations(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.controller = lifecycle_context
        .controller
        .failing(ControllerFailure::Create);
    lifecycle_context
}

#[given("the controller rejects expansions")]
fn controller_rejects_expansions(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.controller = lifecycle_context
        .controller
        .failing(ControllerFailure::Expand);
    lifecycle_context
}

#[given("the journal lock \"{key}\" is held by another request")]
fn journal_lock_held(mut lifecycle_context: LifecycleContext, key: String) -> LifecycleContext {
    lifecycle_context.held_lock = Some(key);
    lifecycle_context
}

#[given("an existing protected set with \"{size}\" GiB journals")]
fn existing_protected_set(mut lifecycle_context: LifecycleContext, size: u64) -> LifecycleContext {
    let set = seed_protected_set(
        &lifecycle_context.store,
        100 * BYTES_PER_GIB,
        size * BYTES_PER_GIB,
    );
    lifecycle_context.protected_set = Some(set);
    lifecycle_context
}

#[given("a \"{source}\" source and a \"{target}\" target of \"{size}\" GiB")]
fn mixed_family_pair(
    mut lifecycle_context: LifecycleContext,
    source: String,
    target: String,
    size: u64,
) -> Result<LifecycleContext, StepError> {
    let store = &lifecycle_context.store;
    let source_system = seed_family_system(store, parse_family(&source)?)?;
    let target_system = seed_family_system(store, parse_family(&target)?)?;
    let mut source_volume = placed_volume("pair-source", &source_system, size * BYTES_PER_GIB);
    source_volume.personality = Personality::Source;
    let mut target_volume = placed_volume("pair-target", &target_system, size * BYTES_PER_GIB);
    target_volume.personality = Personality::Target;
    let ids = (source_volume.id.clone(), target_volume.id.clone());
    store
        .put_volume(source_volume)
        .map_err(LifecycleTestError::from)?;
    store
        .put_volume(target_volume)
        .map_err(LifecycleTestError::from)?;
    lifecycle_context.pair = Some(ids);
    Ok(lifecycle_context)
}

#[given("a replication group of \"{count}\" volumes")]
fn replication_group(
    mut lifecycle_context: LifecycleContext,
    count: usize,
) -> Result<LifecycleContext, StepError> {
    let system = group_system();
    for index in 1..=count {
        let mut volume =
            placed_volume(&format!("grouped-{index}"), &system, 10 * BYTES_PER_GIB);
        volume.replication_group = Some(String::from("rg-1"));
        lifecycle_context.group_members.push(volume.id.clone());
        lifecycle_context
            .store
            .put_volume(volume)
            .map_err(LifecycleTestError::from)?;
    }
    Ok(lifecycle_context)
}

#[when("I create a protected volume of \"{size}\" GiB")]
fn create_protected_volume(
    mut lifecycle_context: LifecycleContext,
    size: u64,
) -> Result<LifecycleContext, StepError> {
    let runtime = runtime()?;
    let lifecycle = orchestrator(&lifecycle_context);
    let locks = lifecycle_context.locks.clone();
    let held = lifecycle_context.held_lock.clone();
    let creation = request(GOLD, 1, size * BYTES_PER_GIB);
    let proposals = vec![protected_proposal(1, size * BYTES_PER_GIB)];

    let result = runtime.block_on(async move {
        let guard = match held {
            Some(key) => Some(
                locks
                    .acquire(&key, LOCK_TIMEOUT)
                    .await
                    .map_err(setup)?,
            ),
            None => None,
        };
        let outcome = lifecycle
            .create_volumes(&creation, &proposals, &task())
            .await;
        drop(guard);
        Ok::<_, StepError>(outcome)
    })?;

    lifecycle_context.outcome = Some(LifecycleResult::from_outcome(result));
    Ok(lifecycle_context)
}

#[when("I reconcile the pair at \"{size}\" GiB")]
fn reconcile_pair(
    mut lifecycle_context: LifecycleContext,
    size: u64,
) -> Result<LifecycleContext, StepError> {
    let (source, target) = pair(&lifecycle_context)?;
    let members = [source, target];
    let calculators = CalculatorSet::new();
    let reconciler = CapacityReconciler::new(
        &lifecycle_context.store,
        &calculators,
        lifecycle_context.settings.target_skew_bytes,
    );
    let reconciliation = reconciler
        .reconcile(&ReconcileRequest::new(&members, size * BYTES_PER_GIB))
        .map_err(setup)?;
    reconciler.persist(&reconciliation).map_err(setup)?;
    lifecycle_context.plan = Some(reconciliation.plan());
    Ok(lifecycle_context)
}

#[when("I migrate \"{count}\" of the group volumes")]
fn migrate_group_volumes(
    mut lifecycle_context: LifecycleContext,
    count: usize,
) -> Result<LifecycleContext, StepError> {
    let runtime = runtime()?;
    let lifecycle = orchestrator(&lifecycle_context);
    let volumes: Vec<VolumeId> = lifecycle_context
        .group_members
        .iter()
        .take(count)
        .cloned()
        .collect();
    let change = TierChangeRequest {
        volumes: volumes.clone(),
        new_virtual_pool: GOLD.into(),
        change: TierChange::DataMigration {
            migrations: volumes
                .into_iter()
                .map(|volume| MigrationTarget {
                    volume,
                    target: Placement {
                        virtual_array: EAST.into(),
                        virtual_pool: GOLD.into(),
                        storage_pool: Some("array-west-pool".into()),
                        storage_system: "array-west".into(),
                    },
                })
                .collect(),
        },
    };

    let result =
        runtime.block_on(async move { lifecycle.change_virtual_pool(&change, &task()).await });
    lifecycle_context.outcome = Some(LifecycleResult::from_outcome(result));
    Ok(lifecycle_context)
}

#[when("I expand the existing source to \"{size}\" GiB")]
fn expand_existing_source(
    mut lifecycle_context: LifecycleContext,
    size: u64,
) -> Result<LifecycleContext, StepError> {
    let runtime = runtime()?;
    let lifecycle = orchestrator(&lifecycle_context);
    let source = lifecycle_context
        .protected_set
        .as_ref()
        .map(|set| set.source.clone())
        .ok_or_else(|| StepError::Assertion(String::from("no protected set was seeded")))?;

    let result = runtime.block_on(async move {
        lifecycle
            .expand_volume(&source, size * BYTES_PER_GIB, &task())
            .await
    });
    lifecycle_context.outcome = Some(LifecycleResult::from_outcome(result));
    Ok(lifecycle_context)
}

#[then("the request succeeds")]
fn request_succeeds(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match lifecycle_context.outcome {
        Some(LifecycleResult::Success(_)) => Ok(()),
        Some(LifecycleResult::Failure(ref failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the error kind is \"{kind}\"")]
fn error_kind(lifecycle_context: &LifecycleContext, kind: String) -> Result<(), StepError> {
    let expected = parse_failure_kind(&kind)?;
    let Some(LifecycleResult::Failure(failure)) = &lifecycle_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if failure.kind == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure kind {expected:?}, got {:?}: {}",
            failure.kind, failure.message
        )))
    }
}

#[then("one batch is submitted with journals before sources before targets")]
fn ordered_batch(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let batch = only_submission(lifecycle_context)?;
    if batch.kind != SubmissionKind::Create {
        return Err(StepError::Assertion(format!(
            "expected a create batch, got {:?}",
            batch.kind
        )));
    }
    verify_creation_order(&batch.descriptors)
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let personalities: Vec<Personality> = batch
        .descriptors
        .iter()
        .map(|descriptor| descriptor.personality)
        .collect();
    let expected = vec![
        Personality::Metadata,
        Personality::Metadata,
        Personality::Source,
        Personality::Target,
    ];
    if personalities == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected batch order: {personalities:?}"
        )))
    }
}

#[then("\"{count}\" task is pending")]
fn tasks_pending(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let tasks = lifecycle_context.tracker.tasks().map_err(setup)?;
    let pending = tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Pending)
        .count();
    if pending == count && tasks.len() == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} pending tasks, got {pending} of {}",
            tasks.len()
        )))
    }
}

#[then("every task is errored")]
fn every_task_errored(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let tasks = lifecycle_context.tracker.tasks().map_err(setup)?;
    if tasks.is_empty() {
        return Err(StepError::Assertion(String::from("no task was created")));
    }
    match tasks
        .iter()
        .find(|task| !matches!(task.status, TaskStatus::Error { .. }))
    {
        Some(task) => Err(StepError::Assertion(format!(
            "task for {} is still {:?}",
            task.volume, task.status
        ))),
        None => Ok(()),
    }
}

#[then("every created record is marked for deletion")]
fn created_records_marked(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let snapshot = lifecycle_context.store.snapshot().map_err(setup)?;
    if snapshot.volumes.is_empty() {
        return Err(StepError::Assertion(String::from(
            "the request created no records",
        )));
    }
    match snapshot.volumes.iter().find(|volume| !volume.inactive) {
        Some(volume) => Err(StepError::Assertion(format!(
            "volume {} is still active",
            volume.id
        ))),
        None => Ok(()),
    }
}

#[then("no batch is submitted")]
fn no_batch(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let submissions = lifecycle_context.controller.submissions();
    if submissions.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no batch, got {}",
            submissions.len()
        )))
    }
}

#[then("no volume record exists")]
fn no_volume_record(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let snapshot = lifecycle_context.store.snapshot().map_err(setup)?;
    if snapshot.volumes.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no volume records, got {}",
            snapshot.volumes.len()
        )))
    }
}

#[then("no journal is created")]
fn no_journal_created(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let batch = only_submission(lifecycle_context)?;
    let journals = batch
        .descriptors
        .iter()
        .filter(|descriptor| descriptor.kind == DescriptorKind::Journal)
        .count();
    if journals == 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no journal descriptors, got {journals}"
        )))
    }
}

#[then("the new source uses the existing source journal")]
fn source_uses_existing_journal(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let existing = lifecycle_context
        .protected_set
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("no protected set was seeded")))?;
    let batch = only_submission(lifecycle_context)?;
    let source = batch
        .descriptors
        .iter()
        .find(|descriptor| descriptor.kind == DescriptorKind::ProtectedSource)
        .ok_or_else(|| StepError::Assertion(String::from("source descriptor missing")))?;
    let journal = source.param(DescriptorParam::Journal);
    if journal == Some(existing.source_journal.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "source journal is {journal:?}, expected {}",
            existing.source_journal
        )))
    }
}

#[then("the plan matches the \"{family}\" rounding of \"{size}\" GiB")]
fn plan_matches_rounding(
    lifecycle_context: &LifecycleContext,
    family: String,
    size: u64,
) -> Result<(), StepError> {
    let expected = family_rounding(&family, size * BYTES_PER_GIB)?;
    match plan(lifecycle_context)? {
        CapacityPlan::Matched(capacity)
            if capacity == expected && capacity > size * BYTES_PER_GIB =>
        {
            Ok(())
        }
        other => Err(StepError::Assertion(format!(
            "expected Matched({expected}), got {other:?}"
        ))),
    }
}

#[then("both volumes are persisted at the matched capacity")]
fn pair_persisted(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let CapacityPlan::Matched(capacity) = plan(lifecycle_context)? else {
        return Err(StepError::Assertion(String::from("plan is not matched")));
    };
    let (source, target) = pair(lifecycle_context)?;
    for id in [source, target] {
        let volume = lifecycle_context.store.require_volume(&id).map_err(setup)?;
        if volume.capacity != capacity {
            return Err(StepError::Assertion(format!(
                "volume {id} carries {} bytes, expected {capacity}",
                volume.capacity
            )));
        }
    }
    Ok(())
}

#[then("the plan is unmatched with a \"{size}\" GiB source")]
fn plan_unmatched(lifecycle_context: &LifecycleContext, size: u64) -> Result<(), StepError> {
    match plan(lifecycle_context)? {
        CapacityPlan::Unmatched { source, target }
            if source == size * BYTES_PER_GIB && target > source =>
        {
            Ok(())
        }
        other => Err(StepError::Assertion(format!(
            "expected an unmatched plan with a {size} GiB source, got {other:?}"
        ))),
    }
}

#[then("the target is the \"{family}\" rounding of \"{size}\" GiB plus the skew")]
fn target_skewed(
    lifecycle_context: &LifecycleContext,
    family: String,
    size: u64,
) -> Result<(), StepError> {
    let expected = family_rounding(&family, size * BYTES_PER_GIB + 5 * BYTES_PER_MIB)?;
    match plan(lifecycle_context)? {
        CapacityPlan::Unmatched { target, .. } if target == expected => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a {expected} byte target, got {other:?}"
        ))),
    }
}

#[then("one migration batch carries \"{count}\" descriptors")]
fn migration_batch(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let batch = only_submission(lifecycle_context)?;
    let grouped = batch
        .descriptors
        .iter()
        .filter(|descriptor| descriptor.kind == DescriptorKind::DataMigration)
        .filter(|descriptor| descriptor.param(DescriptorParam::MigrationGroup).is_some())
        .count();
    if batch.kind == SubmissionKind::ChangeVirtualPool && grouped == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} grouped migrations in a change batch, got {grouped} in {:?}",
            batch.kind
        )))
    }
}

#[then("the existing set is back at \"{size}\" GiB")]
fn existing_set_restored(lifecycle_context: &LifecycleContext, size: u64) -> Result<(), StepError> {
    let set = lifecycle_context
        .protected_set
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("no protected set was seeded")))?;
    for id in [&set.source, &set.target] {
        let volume = lifecycle_context.store.require_volume(id).map_err(setup)?;
        if volume.capacity != size * BYTES_PER_GIB {
            return Err(StepError::Assertion(format!(
                "volume {id} carries {} bytes after restore",
                volume.capacity
            )));
        }
    }
    Ok(())
}

fn parse_failure_kind(kind: &str) -> Result<FailureKind, StepError> {
    match kind {
        "placement_exhausted" => Ok(FailureKind::PlacementExhausted),
        "capacity_mismatch" => Ok(FailureKind::CapacityMismatch),
        "invalid_topology" => Ok(FailureKind::InvalidTopology),
        "controller_submission" => Ok(FailureKind::ControllerSubmission),
        "lock_timeout" => Ok(FailureKind::LockTimeout),
        _ => Err(StepError::Assertion(format!(
            "unknown failure kind: {kind}"
        ))),
    }
}
