//! Multi-resource teardown: `purge` across kinds and `down` for one
//! environment. Failures are aggregated, never short-circuited. Listings and
//! each deletion are retried under the driver's [`RetryPolicy`] before a
//! transient failure is reported.
//!
//! [`RetryPolicy`]: super::RetryPolicy

use std::collections::BTreeSet;

use futures::{StreamExt, TryStreamExt, stream};
use serde::{Serialize, Serializer};
use tracing::{info, warn};

use super::MachineDriver;
use crate::backend::{DeleteOptions, MachineBackend, MachineFilter};
use crate::error::{DriverError, ErrorKind};
use crate::resource::{DeletableResource, EnvironmentId, ResourceKind, ResourceKinds, ResourceRef};

/// Outcome of a multi-resource deletion.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct DeletionReport {
    /// Resources removed (or already absent under `force`).
    pub deleted: Vec<ResourceRef>,
    /// Resources whose deletion failed.
    pub failed: Vec<DeletionFailure>,
    /// Resources left in place on purpose.
    pub skipped: Vec<SkippedDeletion>,
}

/// One failed deletion.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DeletionFailure {
    /// The resource.
    pub resource: ResourceRef,
    /// Why it failed.
    #[serde(serialize_with = "serialize_error")]
    pub error: DriverError,
}

/// One resource left in place.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SkippedDeletion {
    /// The resource.
    pub resource: ResourceRef,
    /// Why it was kept.
    pub reason: String,
}

fn serialize_error<S: Serializer>(error: &DriverError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&error.to_string())
}

impl DeletionReport {
    /// Number of resources actually affected.
    #[must_use]
    pub const fn affected(&self) -> usize {
        self.deleted.len()
    }

    /// Returns `true` when nothing failed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Kind of the first failure, used for the process exit status.
    #[must_use]
    pub fn first_failure_kind(&self) -> Option<ErrorKind> {
        self.failed.first().map(|failure| failure.error.kind())
    }

    fn record(&mut self, resource: ResourceRef, outcome: Result<(), DriverError>) {
        match outcome {
            Ok(()) => self.deleted.push(resource),
            Err(error) => {
                warn!(resource = %resource, error = %error, "deletion failed");
                self.failed.push(DeletionFailure { resource, error });
            }
        }
    }
}

impl<B: MachineBackend> MachineDriver<B> {
    /// Deletes every resource of the selected kinds.
    ///
    /// Machines go first, then snapshots, then key pairs. A key pair still
    /// referenced by a live machine is skipped. Deletions within a phase
    /// run concurrently. An empty selection returns an empty report
    /// without touching the provider.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] only when listing fails; per-resource
    /// failures land in the report.
    pub async fn purge(
        &self,
        kinds: ResourceKinds,
        options: DeleteOptions,
    ) -> Result<DeletionReport, DriverError> {
        let mut report = DeletionReport::default();
        if kinds.is_empty() {
            return Ok(report);
        }
        let resources: Vec<DeletableResource> = self
            .settings
            .retry
            .run("list resources", || {
                self.backend.list_deletable_resources(kinds).try_collect()
            })
            .await?;
        info!(count = resources.len(), "purging resources");

        for kind in [ResourceKind::Machine, ResourceKind::Snapshot] {
            let phase = resources.iter().filter(|resource| resource.kind() == kind);
            self.delete_phase(phase, options, &mut report).await;
        }

        if kinds.key_pairs {
            let referenced = self.referenced_key_pairs(&report).await?;
            let mut key_pairs = Vec::new();
            for resource in resources
                .iter()
                .filter(|resource| resource.kind() == ResourceKind::KeyPair)
            {
                if referenced.contains(resource.id()) {
                    warn!(key_pair = resource.id(), "key pair still in use; skipping");
                    report.skipped.push(SkippedDeletion {
                        resource: resource.reference(),
                        reason: String::from("referenced by a live machine"),
                    });
                } else {
                    key_pairs.push(resource);
                }
            }
            self.delete_phase(key_pairs.into_iter(), options, &mut report)
                .await;
        }
        Ok(report)
    }

    /// Deletes the machines of one environment.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] when the environment has no
    /// machines and `force` is unset, or any listing failure.
    pub async fn down(
        &self,
        environment_id: &EnvironmentId,
        options: DeleteOptions,
    ) -> Result<DeletionReport, DriverError> {
        let scope = MachineFilter::environment(environment_id.clone());
        let filter = &scope;
        let machines: Vec<DeletableResource> = self
            .settings
            .retry
            .run("list machines", || {
                self.backend
                    .list_machines(filter)
                    .map_ok(DeletableResource::Machine)
                    .try_collect()
            })
            .await?;
        let mut report = DeletionReport::default();
        if machines.is_empty() {
            return if options.force {
                Ok(report)
            } else {
                Err(DriverError::not_found("environment", environment_id.as_str()))
            };
        }
        info!(environment = %environment_id, machines = machines.len(), "tearing down environment");
        self.delete_phase(machines.iter(), options, &mut report).await;
        Ok(report)
    }

    async fn delete_phase<'r>(
        &self,
        resources: impl Iterator<Item = &'r DeletableResource>,
        options: DeleteOptions,
        report: &mut DeletionReport,
    ) {
        let outcomes: Vec<_> = stream::iter(resources)
            .map(|resource| async move {
                let mut attempted = false;
                let outcome = self
                    .settings
                    .retry
                    .run("delete", || {
                        // Absent on a retry means an earlier attempt went through.
                        let retried = std::mem::replace(&mut attempted, true);
                        let attempt_options = if retried {
                            DeleteOptions {
                                force: true,
                                ..options
                            }
                        } else {
                            options
                        };
                        self.backend.delete_resource(resource, attempt_options)
                    })
                    .await;
                (resource.reference(), outcome)
            })
            .buffer_unordered(self.settings.purge_concurrency.max(1))
            .collect()
            .await;
        for (resource, outcome) in outcomes {
            report.record(resource, outcome);
        }
    }

    async fn referenced_key_pairs(
        &self,
        report: &DeletionReport,
    ) -> Result<BTreeSet<String>, DriverError> {
        let deleted_ids: BTreeSet<&str> = report
            .deleted
            .iter()
            .filter(|resource| resource.kind == ResourceKind::Machine)
            .map(|resource| resource.id.as_str())
            .collect();
        let deleted = &deleted_ids;
        let everything = MachineFilter::default();
        let filter = &everything;
        self.settings
            .retry
            .run("list machines", || {
                self.backend
                    .list_machines(filter)
                    .try_filter_map(move |machine| {
                        let live = !deleted.contains(machine.id.as_str());
                        async move { Ok(machine.key_pair_id.filter(|_| live)) }
                    })
                    .try_collect()
            })
            .await
    }
}
