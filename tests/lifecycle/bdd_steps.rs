//! BDD step definitions for lifecycle behaviour.

use prevue::backend::{DeleteOptions, MachineFilter};
use prevue::error::DriverError;
use prevue::fake::FakeOperation;
use prevue::resource::{ResourceKind, ResourceKinds, SizingHints};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{LifecycleContext, TeardownOutcome, block_on, environment};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("an empty fake account")]
fn empty_account(lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context
}

#[given("the next {count:u32} provisioning calls fail transiently")]
fn provisioning_fails_transiently(lifecycle_context: LifecycleContext, count: u32) -> LifecycleContext {
    lifecycle_context.backend.fail_times(
        FakeOperation::Provision,
        DriverError::Provision(String::from("capacity temporarily unavailable")),
        usize::try_from(count).unwrap_or(usize::MAX),
    );
    lifecycle_context
}

#[given("the next provisioning call hits a quota")]
fn provisioning_hits_quota(lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.backend.fail_next(
        FakeOperation::Provision,
        DriverError::Quota(String::from("instances limit reached")),
    );
    lifecycle_context
}

#[given("{count:u32} snapshots exist")]
fn snapshots_exist(lifecycle_context: LifecycleContext, count: u32) -> LifecycleContext {
    for _ in 0..count {
        lifecycle_context.backend.insert_snapshot(None);
    }
    lifecycle_context
}

#[given("a machine exists for environment \"{name}\"")]
fn machine_exists(lifecycle_context: LifecycleContext, name: String) -> LifecycleContext {
    lifecycle_context
        .backend
        .insert_machine(Some(environment(&name)));
    lifecycle_context
}

#[when("I provision environment \"{name}\"")]
fn provision(mut lifecycle_context: LifecycleContext, name: String) -> LifecycleContext {
    let driver = lifecycle_context.driver();
    let environment_id = environment(&name);
    let result = block_on(driver.provision(&environment_id, &SizingHints::default()));
    lifecycle_context.provision_result = Some(result.map(|machine| machine.id));
    lifecycle_context
}

fn tear_down(mut lifecycle_context: LifecycleContext, name: &str, force: bool) -> LifecycleContext {
    let driver = lifecycle_context.driver();
    let environment_id = environment(name);
    let options = DeleteOptions { wait: true, force };
    let outcome = match block_on(driver.down(&environment_id, options)) {
        Ok(report) => TeardownOutcome::Report(report),
        Err(err) => TeardownOutcome::Failure(err),
    };
    lifecycle_context.teardown = Some(outcome);
    lifecycle_context
}

#[when("I tear down environment \"{name}\"")]
fn tear_down_strict(lifecycle_context: LifecycleContext, name: String) -> LifecycleContext {
    tear_down(lifecycle_context, &name, false)
}

#[when("I force tear down environment \"{name}\"")]
fn tear_down_forced(lifecycle_context: LifecycleContext, name: String) -> LifecycleContext {
    tear_down(lifecycle_context, &name, true)
}

fn purge(
    mut lifecycle_context: LifecycleContext,
    kinds: ResourceKinds,
    force: bool,
) -> LifecycleContext {
    let driver = lifecycle_context.driver();
    let options = DeleteOptions { wait: true, force };
    let outcome = match block_on(driver.purge(kinds, options)) {
        Ok(report) => TeardownOutcome::Report(report),
        Err(err) => TeardownOutcome::Failure(err),
    };
    lifecycle_context.teardown = Some(outcome);
    lifecycle_context
}

#[when("I purge snapshots with force")]
fn purge_snapshots(lifecycle_context: LifecycleContext) -> LifecycleContext {
    purge(lifecycle_context, ResourceKinds::only(ResourceKind::Snapshot), true)
}

#[when("I purge no resource kinds")]
fn purge_nothing(lifecycle_context: LifecycleContext) -> LifecycleContext {
    purge(lifecycle_context, ResourceKinds::none(), false)
}

#[when("I purge key pairs")]
fn purge_key_pairs(lifecycle_context: LifecycleContext) -> LifecycleContext {
    purge(lifecycle_context, ResourceKinds::only(ResourceKind::KeyPair), false)
}

#[then("the number of created machines is {count:u32}")]
fn created_machines(lifecycle_context: &LifecycleContext, count: u32) -> Result<(), StepError> {
    let actual = lifecycle_context.backend.created_machines();
    if actual == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} created machines, got {actual}"
        )))
    }
}

#[then("provisioning succeeded")]
fn provisioning_succeeded(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match &lifecycle_context.provision_result {
        Some(Ok(_)) => Ok(()),
        Some(Err(err)) => Err(StepError::Assertion(format!(
            "provisioning failed unexpectedly: {err}"
        ))),
        None => Err(StepError::Assertion(String::from("provisioning never ran"))),
    }
}

#[then("provisioning fails with kind \"{kind}\"")]
fn provisioning_fails(lifecycle_context: &LifecycleContext, kind: String) -> Result<(), StepError> {
    match &lifecycle_context.provision_result {
        Some(Err(err)) if err.kind().as_str() == kind.trim() => Ok(()),
        Some(Err(err)) => Err(StepError::Assertion(format!(
            "expected kind {kind}, got {}",
            err.kind()
        ))),
        Some(Ok(id)) => Err(StepError::Assertion(format!(
            "provisioning unexpectedly returned machine {id}"
        ))),
        None => Err(StepError::Assertion(String::from("provisioning never ran"))),
    }
}

#[then("environment \"{name}\" has a live machine")]
fn has_live_machine(lifecycle_context: &LifecycleContext, name: String) -> Result<(), StepError> {
    let filter = MachineFilter::environment(environment(&name));
    match lifecycle_context.live_machines(&filter) {
        1 => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected one machine for {name}, found {other}"
        ))),
    }
}

#[then("environment \"{name}\" has no live machine")]
fn has_no_live_machine(lifecycle_context: &LifecycleContext, name: String) -> Result<(), StepError> {
    let filter = MachineFilter::environment(environment(&name));
    match lifecycle_context.live_machines(&filter) {
        0 => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected no machine for {name}, found {other}"
        ))),
    }
}

#[then("the number of live machines is {count:u32}")]
fn live_machine_count(lifecycle_context: &LifecycleContext, count: u32) -> Result<(), StepError> {
    let actual = lifecycle_context.live_machines(&MachineFilter::default());
    if u32::try_from(actual).is_ok_and(|live| live == count) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} live machines, found {actual}"
        )))
    }
}

#[then("the report counts {count:u32} affected resources")]
fn report_affected(lifecycle_context: &LifecycleContext, count: u32) -> Result<(), StepError> {
    let Some(report) = lifecycle_context.report() else {
        return Err(StepError::Assertion(format!(
            "expected a deletion report, got {:?}",
            lifecycle_context.teardown
        )));
    };
    if !report.is_success() {
        return Err(StepError::Assertion(format!(
            "report carries failures: {:?}",
            report.failed
        )));
    }
    if u32::try_from(report.affected()).is_ok_and(|n| n == count) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} affected resources, got {}",
            report.affected()
        )))
    }
}

#[then("the report skips {count:u32} resources")]
fn report_skipped(lifecycle_context: &LifecycleContext, count: u32) -> Result<(), StepError> {
    let skipped = lifecycle_context
        .report()
        .map(|report| report.skipped.len())
        .unwrap_or_default();
    if u32::try_from(skipped).is_ok_and(|n| n == count) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} skipped resources, got {skipped}"
        )))
    }
}

#[then("the teardown fails with kind \"{kind}\"")]
fn teardown_fails(lifecycle_context: &LifecycleContext, kind: String) -> Result<(), StepError> {
    match &lifecycle_context.teardown {
        Some(TeardownOutcome::Failure(err)) if err.kind().as_str() == kind.trim() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a {kind} failure, got {other:?}"
        ))),
    }
}
