//! BDD scenarios for the lifecycle orchestrator.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Create a protected volume and submit one ordered batch"
)]
fn scenario_protected_create(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Roll back a protected create when the controller rejects it"
)]
fn scenario_create_rollback(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Time out waiting for the journal naming lock"
)]
fn scenario_lock_timeout(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Reuse journals that already cover the new source"
)]
fn scenario_journal_reuse(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Match capacities by anchoring on the rounding family"
)]
fn scenario_matched_capacity(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Skew the target when families cannot match"
)]
fn scenario_unmatched_capacity(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Reject a migration naming part of a replication group"
)]
fn scenario_partial_group(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Migrate a whole replication group together"
)]
fn scenario_whole_group(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Restore tracked capacities after a rejected expansion"
)]
fn scenario_expand_restore(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}
