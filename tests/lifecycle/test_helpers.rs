//! Shared fixtures and helpers for lifecycle BDD scenarios.

use std::future::Future;

use prevue::backend::MachineFilter;
use prevue::driver::{DeletionReport, DriverSettings, MachineDriver};
use prevue::error::DriverError;
use prevue::fake::FakeBackend;
use prevue::resource::EnvironmentId;
use rstest::fixture;
use tokio::runtime::Runtime;

#[derive(Clone, Debug)]
pub enum TeardownOutcome {
    Report(DeletionReport),
    Failure(DriverError),
}

#[derive(Clone, Debug)]
pub struct LifecycleContext {
    pub backend: FakeBackend,
    pub provision_result: Option<Result<String, DriverError>>,
    pub teardown: Option<TeardownOutcome>,
}

#[fixture]
pub fn lifecycle_context() -> LifecycleContext {
    LifecycleContext {
        backend: FakeBackend::new("default"),
        provision_result: None,
        teardown: None,
    }
}

impl LifecycleContext {
    /// A driver over the shared fake; clones of the backend share state.
    pub fn driver(&self) -> MachineDriver<FakeBackend> {
        MachineDriver::new(self.backend.clone(), DriverSettings::default())
    }

    pub fn live_machines(&self, filter: &MachineFilter) -> usize {
        let driver = self.driver();
        block_on(async {
            use futures::TryStreamExt;
            let machines: Vec<_> = driver
                .list_machines(filter)
                .try_collect()
                .await
                .unwrap_or_else(|err| panic!("listing machines should succeed: {err}"));
            machines.len()
        })
    }

    pub fn report(&self) -> Option<&DeletionReport> {
        match self.teardown.as_ref()? {
            TeardownOutcome::Report(report) => Some(report),
            TeardownOutcome::Failure(_) => None,
        }
    }
}

pub fn environment(raw: &str) -> EnvironmentId {
    EnvironmentId::normalize(raw.trim())
        .unwrap_or_else(|err| panic!("environment id should be valid: {err}"))
}

pub fn block_on<F: Future>(future: F) -> F::Output {
    Runtime::new()
        .unwrap_or_else(|err| panic!("tokio runtime should start: {err}"))
        .block_on(future)
}
