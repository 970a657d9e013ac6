//! Machine driver: a thin, uniform facade over the selected backend.
//!
//! The driver owns exactly one backend and caches nothing between calls.
//! It adds environment id resolution, retries with backoff for transient
//! failures, an overall provisioning deadline and the aggregated teardown
//! flows in [`purge`].

mod env_id;
mod purge;
mod retry;

use std::collections::BTreeSet;
use std::time::Duration;

use futures::TryStreamExt;
use tokio::time::timeout;
use tracing::{debug, info};

pub use env_id::{DefaultDetector, EnvironmentDetector, ProjectContext};
pub use purge::{DeletionFailure, DeletionReport, SkippedDeletion};
pub use retry::RetryPolicy;

use crate::backend::{Backend, MachineBackend, MachineFilter, ResourceStream};
use crate::config::PrevueConfig;
use crate::error::DriverError;
use crate::resource::{
    ConnectionParams, EnvironmentId, Machine, ResourceKinds, ResourceRow, SizingHints, Snapshot,
};

/// Tunables the driver applies on top of the backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DriverSettings {
    /// Retry behaviour for transient failures.
    pub retry: RetryPolicy,
    /// Overall deadline for one `provision` call, retries included.
    pub provision_timeout: Duration,
    /// Concurrent deletions per purge phase.
    pub purge_concurrency: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
            },
            provision_timeout: Duration::from_secs(900),
            purge_concurrency: 4,
        }
    }
}

impl From<&PrevueConfig> for DriverSettings {
    fn from(config: &PrevueConfig) -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: config.retry_attempts.max(1),
                base_delay: config.retry_base_delay(),
                max_delay: Duration::from_secs(30),
            },
            provision_timeout: config.provision_timeout(),
            purge_concurrency: usize::try_from(config.purge_concurrency).unwrap_or(1),
        }
    }
}

/// Uniform entry point for machine lifecycle operations.
pub struct MachineDriver<B: MachineBackend = Backend> {
    backend: B,
    settings: DriverSettings,
    detector: Box<dyn EnvironmentDetector>,
}

impl<B: MachineBackend> std::fmt::Debug for MachineDriver<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineDriver")
            .field("backend", &self.backend.kind())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl MachineDriver<Backend> {
    /// Builds the driver for the backend named in configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Configuration`] for unknown drivers or
    /// incomplete backend settings.
    pub fn from_config(config: &PrevueConfig) -> Result<Self, DriverError> {
        let backend = Backend::from_config(config)?;
        Ok(Self::new(backend, DriverSettings::from(config)))
    }
}

impl<B: MachineBackend> MachineDriver<B> {
    /// Wraps `backend` with the default environment detector.
    #[must_use]
    pub fn new(backend: B, settings: DriverSettings) -> Self {
        Self {
            backend,
            settings,
            detector: Box::new(DefaultDetector),
        }
    }

    /// Replaces the environment detector.
    #[must_use]
    pub fn with_detector(mut self, detector: impl EnvironmentDetector + 'static) -> Self {
        self.detector = Box::new(detector);
        self
    }

    /// The wrapped backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Resolves the environment id for a command.
    ///
    /// An explicit id wins. Otherwise the detector inspects the project
    /// context and, failing that, the environments with live machines.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Configuration`] for unusable ids or when
    /// nothing can be detected, and [`DriverError::AmbiguousEnvironment`]
    /// when several live environments match.
    pub async fn resolve_environment_id(
        &self,
        explicit: Option<&str>,
        context: &ProjectContext,
    ) -> Result<EnvironmentId, DriverError> {
        if let Some(raw) = explicit {
            return EnvironmentId::normalize(raw);
        }
        if let Some(detected) = self.detector.from_project(context)? {
            debug!(environment = %detected, "environment derived from project");
            return Ok(detected);
        }
        let filter = MachineFilter {
            environment_id: None,
            exclude_untagged: true,
        };
        let live: BTreeSet<EnvironmentId> = self
            .backend
            .list_machines(&filter)
            .try_filter_map(|machine| async move { Ok(machine.environment_id) })
            .try_collect()
            .await?;
        self.detector.from_live(&live)
    }

    /// Streams machines matching `filter`.
    pub fn list_machines<'a>(&'a self, filter: &'a MachineFilter) -> ResourceStream<'a, Machine> {
        self.backend.list_machines(filter)
    }

    /// Returns the live machine for `environment_id`, if any.
    ///
    /// # Errors
    ///
    /// Propagates listing failures.
    pub async fn find_machine(
        &self,
        environment_id: &EnvironmentId,
    ) -> Result<Option<Machine>, DriverError> {
        let filter = MachineFilter::environment(environment_id.clone());
        let mut machines = self.backend.list_machines(&filter);
        machines.try_next().await
    }

    /// Provisions (or reuses) the machine for `environment_id`.
    ///
    /// Transient failures are retried per [`RetryPolicy`]; the whole call,
    /// retries included, is bounded by the provisioning deadline.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Timeout`] when the deadline expires, or the
    /// backend error once retries are exhausted.
    pub async fn provision(
        &self,
        environment_id: &EnvironmentId,
        hints: &SizingHints,
    ) -> Result<Machine, DriverError> {
        info!(environment = %environment_id, backend = %self.backend.kind(), "provisioning");
        let attempts = self
            .settings
            .retry
            .run("provision", || self.backend.provision(environment_id, hints));
        let machine = timeout(self.settings.provision_timeout, attempts)
            .await
            .map_err(|_| DriverError::timeout("provisioning", environment_id.as_str()))??;
        info!(environment = %environment_id, machine = %machine.id, "machine ready");
        Ok(machine)
    }

    /// Connection parameters for the environment's machine.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] when the environment has no
    /// machine.
    pub async fn connection_params(
        &self,
        environment_id: &EnvironmentId,
    ) -> Result<(Machine, ConnectionParams), DriverError> {
        let machine = self
            .find_machine(environment_id)
            .await?
            .ok_or_else(|| DriverError::not_found("environment", environment_id.as_str()))?;
        let params = self.backend.connection_params(&machine)?;
        Ok((machine, params))
    }

    /// Snapshots the environment's machine.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] when the environment has no
    /// machine, or the backend error.
    pub async fn snapshot(&self, environment_id: &EnvironmentId) -> Result<Snapshot, DriverError> {
        let machine = self
            .find_machine(environment_id)
            .await?
            .ok_or_else(|| DriverError::not_found("environment", environment_id.as_str()))?;
        let snapshot = self.backend.create_snapshot(&machine).await?;
        info!(environment = %environment_id, snapshot = %snapshot.id, "snapshot created");
        Ok(snapshot)
    }

    /// Listing rows for the selected kinds, in provider order. Transient
    /// listing failures are retried.
    ///
    /// # Errors
    ///
    /// Propagates listing failures.
    pub async fn rows(&self, kinds: ResourceKinds) -> Result<Vec<ResourceRow>, DriverError> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        self.settings
            .retry
            .run("list resources", || {
                self.backend
                    .list_deletable_resources(kinds)
                    .map_ok(|resource| resource.row())
                    .try_collect()
            })
            .await
    }
}
