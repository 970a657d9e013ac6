//! Backend abstraction for provisioning preview machines.
//!
//! Every provider implements [`MachineBackend`] independently; there is no
//! shared base implementation. [`Backend`] closes the set of known providers
//! so selection happens once, from configuration, at startup.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use futures::stream::BoxStream;

use crate::config::{KubeConfig, PrevueConfig, ScalewayConfig};
use crate::error::DriverError;
use crate::fake::FakeBackend;
use crate::kube::KubeBackend;
use crate::resource::{
    ConnectionParams, DeletableResource, EnvironmentId, Machine, ResourceKinds, SizingHints,
    Snapshot,
};
use crate::scaleway::ScalewayBackend;

/// Future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 'a>>;

/// Lazy sequence of resources; each call to a listing method starts a fresh
/// provider query.
pub type ResourceStream<'a, T> = BoxStream<'a, Result<T, DriverError>>;

/// Options accepted by [`MachineBackend::delete_resource`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeleteOptions {
    /// Block until the provider confirms removal.
    pub wait: bool,
    /// Treat an already-absent resource as success.
    pub force: bool,
}

impl DeleteOptions {
    /// Resolves the outcome for a resource the provider reports as absent.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] unless `force` is set.
    pub fn absent(self, resource: &DeletableResource) -> Result<(), DriverError> {
        if self.force {
            Ok(())
        } else {
            Err(DriverError::not_found(
                resource.kind().as_str(),
                resource.id(),
            ))
        }
    }
}

/// Narrows machine listings.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MachineFilter {
    /// Only machines tagged with this environment id.
    pub environment_id: Option<EnvironmentId>,
    /// Drop machines that carry no environment tag.
    pub exclude_untagged: bool,
}

impl MachineFilter {
    /// Filter selecting one environment.
    #[must_use]
    pub const fn environment(environment_id: EnvironmentId) -> Self {
        Self {
            environment_id: Some(environment_id),
            exclude_untagged: true,
        }
    }

    /// Returns `true` when `machine` passes the filter.
    #[must_use]
    pub fn matches(&self, machine: &Machine) -> bool {
        if self.exclude_untagged && machine.is_untagged() {
            return false;
        }
        self.environment_id
            .as_ref()
            .is_none_or(|id| machine.belongs_to(id))
    }
}

/// Capability set every provider implements.
pub trait MachineBackend: Send + Sync {
    /// Identifies the provider.
    fn kind(&self) -> BackendKind;

    /// Provisions (or returns the existing) machine for an environment and
    /// waits until it is reachable.
    fn provision<'a>(
        &'a self,
        environment_id: &'a EnvironmentId,
        hints: &'a SizingHints,
    ) -> BackendFuture<'a, Machine>;

    /// Lists machines, surfacing untagged ones unless filtered out.
    fn list_machines<'a>(&'a self, filter: &'a MachineFilter) -> ResourceStream<'a, Machine>;

    /// Lists machines, snapshots and key pairs restricted to `kinds`.
    fn list_deletable_resources(
        &self,
        kinds: ResourceKinds,
    ) -> ResourceStream<'_, DeletableResource>;

    /// Deletes one resource.
    fn delete_resource<'a>(
        &'a self,
        resource: &'a DeletableResource,
        options: DeleteOptions,
    ) -> BackendFuture<'a, ()>;

    /// Captures a snapshot of the machine's disk.
    fn create_snapshot<'a>(&'a self, machine: &'a Machine) -> BackendFuture<'a, Snapshot>;

    /// Describes how to reach `machine` without connecting to it.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Unreachable`] when the machine has no usable
    /// address yet.
    fn connection_params(&self, machine: &Machine) -> Result<ConnectionParams, DriverError>;
}

/// Known backend identifiers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BackendKind {
    /// Scaleway Instances (cloud VM).
    Scaleway,
    /// Kubernetes Deployments (pod).
    Kube,
    /// In-memory fake.
    Fake,
}

impl BackendKind {
    /// Every identifier accepted in configuration.
    pub const ALL: [Self; 3] = [Self::Scaleway, Self::Kube, Self::Fake];

    /// Configuration identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scaleway => "scaleway",
            Self::Kube => "kube",
            Self::Fake => "fake",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = DriverError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| {
                let known = Self::ALL
                    .iter()
                    .map(|kind| kind.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                DriverError::Configuration(format!(
                    "unknown driver '{value}': expected one of {known}"
                ))
            })
    }
}

/// The active backend, one variant per provider.
#[derive(Clone)]
pub enum Backend {
    /// Cloud VM backend.
    Scaleway(ScalewayBackend),
    /// Pod backend.
    Kube(KubeBackend),
    /// In-process fake.
    Fake(FakeBackend),
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backend").field(&self.kind()).finish()
    }
}

impl From<ScalewayBackend> for Backend {
    fn from(value: ScalewayBackend) -> Self {
        Self::Scaleway(value)
    }
}

impl From<KubeBackend> for Backend {
    fn from(value: KubeBackend) -> Self {
        Self::Kube(value)
    }
}

impl From<FakeBackend> for Backend {
    fn from(value: FakeBackend) -> Self {
        Self::Fake(value)
    }
}

impl Backend {
    /// Selects and builds the backend named by `config.driver`.
    ///
    /// Provider settings are loaded only for the selected backend, so the
    /// fake never needs cloud credentials.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Configuration`] for unknown drivers or
    /// incomplete provider settings.
    pub fn from_config(config: &PrevueConfig) -> Result<Self, DriverError> {
        config.validate()?;
        let profile = config.profile.as_str();
        match config.backend_kind()? {
            BackendKind::Scaleway => {
                let scaleway = ScalewayConfig::load_without_cli_args()?;
                ScalewayBackend::new(scaleway, profile).map(Self::from)
            }
            BackendKind::Kube => {
                let kube = KubeConfig::load_without_cli_args()?;
                KubeBackend::new(kube, profile).map(Self::from)
            }
            BackendKind::Fake => Ok(Self::from(FakeBackend::new(profile))),
        }
    }

    fn inner(&self) -> &dyn MachineBackend {
        match self {
            Self::Scaleway(backend) => backend,
            Self::Kube(backend) => backend,
            Self::Fake(backend) => backend,
        }
    }
}

impl MachineBackend for Backend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    fn provision<'a>(
        &'a self,
        environment_id: &'a EnvironmentId,
        hints: &'a SizingHints,
    ) -> BackendFuture<'a, Machine> {
        self.inner().provision(environment_id, hints)
    }

    fn list_machines<'a>(&'a self, filter: &'a MachineFilter) -> ResourceStream<'a, Machine> {
        self.inner().list_machines(filter)
    }

    fn list_deletable_resources(
        &self,
        kinds: ResourceKinds,
    ) -> ResourceStream<'_, DeletableResource> {
        self.inner().list_deletable_resources(kinds)
    }

    fn delete_resource<'a>(
        &'a self,
        resource: &'a DeletableResource,
        options: DeleteOptions,
    ) -> BackendFuture<'a, ()> {
        self.inner().delete_resource(resource, options)
    }

    fn create_snapshot<'a>(&'a self, machine: &'a Machine) -> BackendFuture<'a, Snapshot> {
        self.inner().create_snapshot(machine)
    }

    fn connection_params(&self, machine: &Machine) -> Result<ConnectionParams, DriverError> {
        self.inner().connection_params(machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::KeyPair;
    use rstest::rstest;

    #[rstest]
    #[case("scaleway", BackendKind::Scaleway)]
    #[case(" Kube ", BackendKind::Kube)]
    #[case("fake", BackendKind::Fake)]
    fn backend_kind_parses_known_identifiers(#[case] raw: &str, #[case] expected: BackendKind) {
        assert_eq!(raw.parse::<BackendKind>().expect("parses"), expected);
    }

    #[test]
    fn backend_kind_rejects_unknown_identifiers() {
        let err = "gcp".parse::<BackendKind>().expect_err("unknown driver");
        assert!(
            matches!(err, DriverError::Configuration(ref message) if message.contains("scaleway, kube, fake")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn absent_resources_follow_force_flag() {
        let resource = DeletableResource::KeyPair(KeyPair {
            id: String::from("key-1"),
            name: String::from("prevue-default"),
            fingerprint: None,
            created_at: None,
        });
        let strict = DeleteOptions {
            wait: false,
            force: false,
        };
        let forced = DeleteOptions {
            wait: false,
            force: true,
        };
        assert!(matches!(
            strict.absent(&resource),
            Err(DriverError::NotFound { .. })
        ));
        assert!(forced.absent(&resource).is_ok());
    }
}
