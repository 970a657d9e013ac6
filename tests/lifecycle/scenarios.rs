//! BDD scenarios for machine lifecycle and teardown.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Provisioning an environment twice reuses its machine"
)]
fn scenario_provisioning_is_idempotent(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Transient provisioning failures are retried"
)]
fn scenario_transient_failures_retry(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Quota failures are not retried"
)]
fn scenario_quota_failures_are_fatal(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Tearing an environment down is terminal"
)]
fn scenario_teardown_is_terminal(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/teardown.feature",
    name = "Purging snapshots leaves machines alone"
)]
fn scenario_purge_snapshots(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/teardown.feature",
    name = "Purging without any kind selected is a no-op"
)]
fn scenario_empty_purge(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/teardown.feature",
    name = "Key pairs used by live machines survive a purge"
)]
fn scenario_key_pairs_in_use_are_skipped(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/teardown.feature",
    name = "Tearing down a missing environment fails"
)]
fn scenario_missing_environment_fails(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/teardown.feature",
    name = "Forcing teardown of a missing environment succeeds"
)]
fn scenario_forced_teardown_of_missing_environment(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}
