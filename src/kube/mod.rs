//! Pod backend on Kubernetes Deployments.
//!
//! Each environment is one single-replica deployment labelled with the
//! environment id. Key pairs are opaque secrets mounted into the pod. The
//! backend has no disk snapshots; commands reach the pod through
//! `kubectl exec`. Looking up a single environment also resolves its pod's
//! cluster address, which is where exposed service ports are served.

mod api;
mod manifest;

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use tokio::time::sleep;
use tracing::info;

use crate::backend::{
    BackendFuture, BackendKind, DeleteOptions, MachineBackend, MachineFilter, ResourceStream,
};
use crate::config::KubeConfig;
use crate::error::DriverError;
use crate::resource::{
    Address, AuthMethod, ConnectionParams, DeletableResource, EnvironmentId, KeyPair, Machine,
    ResourceKinds, SizingHints, Snapshot,
};

use api::{Created, Deployment, KubeClient, ObjectList, Pod, Secret};

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const DELETE_TIMEOUT: Duration = Duration::from_secs(120);

/// Backend that runs environments as pods.
#[derive(Clone)]
pub struct KubeBackend {
    client: KubeClient,
    config: KubeConfig,
    profile: String,
    poll_interval: Duration,
    wait_timeout: Duration,
    delete_timeout: Duration,
}

impl KubeBackend {
    /// Constructs a backend, reading the service account token when no
    /// explicit token is configured.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Configuration`] when validation fails or no
    /// token can be found.
    pub fn new(config: KubeConfig, profile: impl Into<String>) -> Result<Self, DriverError> {
        config.validate()?;
        let token = match config.token.clone() {
            Some(token) => token,
            None => crate::fs::read_to_string(SERVICE_ACCOUNT_TOKEN)
                .map(|token| token.trim().to_owned())
                .map_err(|_| {
                    DriverError::Configuration(String::from(
                        "missing bearer token: set PREVUE_KUBE_TOKEN or add token to prevue.toml",
                    ))
                })?,
        };
        Ok(Self {
            client: KubeClient::new(&config, token)?,
            config,
            profile: profile.into(),
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
            delete_timeout: DELETE_TIMEOUT,
        })
    }

    fn key_pair_name(&self) -> String {
        manifest::key_pair_name(&self.profile)
    }

    fn machine_from_deployment(&self, deployment: Deployment) -> Machine {
        let phase = deployment.phase().to_owned();
        let metadata = deployment.metadata;
        let environment_id = metadata
            .labels
            .get(manifest::ENVIRONMENT_LABEL)
            .and_then(|raw| EnvironmentId::normalize(raw).ok());
        Machine {
            id: metadata.name,
            environment_id,
            created_at: metadata
                .creation_timestamp
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            address: None,
            region: metadata
                .namespace
                .unwrap_or_else(|| self.client.namespace().to_owned()),
            instance_type: deployment
                .spec
                .template
                .spec
                .containers
                .into_iter()
                .next()
                .and_then(|container| container.image),
            status: phase,
            key_pair_id: metadata.labels.get(manifest::KEY_PAIR_NAME_LABEL).cloned(),
        }
    }

    fn key_pair_from_secret(secret: Secret) -> KeyPair {
        KeyPair {
            id: secret.metadata.name.clone(),
            name: secret.metadata.name,
            fingerprint: None,
            created_at: secret.metadata.creation_timestamp,
        }
    }

    fn paged<'a, T, F, Fut>(fetch: F) -> BoxStream<'a, Result<T, DriverError>>
    where
        T: Send + 'a,
        F: Fn(Option<String>) -> Fut + Send + 'a,
        Fut: Future<Output = Result<ObjectList<T>, DriverError>> + Send + 'a,
    {
        stream::try_unfold((fetch, Some(None)), |(fetch, cursor)| async move {
            let Some(token) = cursor else {
                return Ok::<_, DriverError>(None);
            };
            let page = fetch(token).await?;
            let next = page.next_page().map(Some);
            Ok(Some((page.items, (fetch, next))))
        })
        .map_ok(|items| stream::iter(items.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    fn deployments_matching(&self, selector: String) -> ResourceStream<'_, Machine> {
        Self::paged(move |token| {
            let selector = selector.clone();
            async move {
                self.client
                    .list_deployments(&selector, token.as_deref())
                    .await
            }
        })
        .map_ok(move |deployment| self.machine_from_deployment(deployment))
        .boxed()
    }

    /// Sets the machine address to its running pod's IP. The port is left
    /// at 0: pods are reached through `kubectl exec`, not a login port.
    async fn with_pod_address(&self, mut machine: Machine) -> Result<Machine, DriverError> {
        let Some(environment_id) = machine.environment_id.as_ref() else {
            return Ok(machine);
        };
        let pods = self
            .client
            .list_pods(&manifest::environment_selector(environment_id))
            .await?;
        machine.address = pods
            .iter()
            .find_map(Pod::serving_ip)
            .map(|ip| Address::new(ip, 0));
        Ok(machine)
    }

    fn key_pairs(&self) -> ResourceStream<'_, KeyPair> {
        Self::paged(move |token| async move {
            self.client
                .list_secrets(&manifest::key_pair_selector(), token.as_deref())
                .await
        })
        .map_ok(Self::key_pair_from_secret)
        .boxed()
    }

    async fn ensure_key_pair(&self) -> Result<String, DriverError> {
        let name = self.key_pair_name();
        if self.client.get_secret(&name).await?.is_some() {
            return Ok(name);
        }
        let secret = manifest::key_pair_secret(&name, &self.profile);
        if let Created::New(_) = self.client.create_secret(&name, &secret).await? {
            info!(key_pair = %name, "created key pair secret");
        }
        Ok(name)
    }

    async fn await_available(&self, name: &str) -> Result<Machine, DriverError> {
        let deadline = Instant::now() + self.wait_timeout;
        while Instant::now() <= deadline {
            if let Some(deployment) = self.client.get_deployment(name).await?
                && deployment.is_available()
            {
                return Ok(self.machine_from_deployment(deployment));
            }
            sleep(self.poll_interval).await;
        }
        Err(DriverError::timeout("pod availability", name))
    }

    async fn wait_until_gone<F, Fut>(
        &self,
        kind: &str,
        id: &str,
        mut poll: F,
    ) -> Result<(), DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, DriverError>>,
    {
        let deadline = Instant::now() + self.delete_timeout;
        while Instant::now() <= deadline {
            if !poll().await? {
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }
        Err(DriverError::timeout(format!("{kind} removal"), id))
    }

    async fn provision_machine(
        &self,
        environment_id: &EnvironmentId,
        hints: &SizingHints,
    ) -> Result<Machine, DriverError> {
        let filter = MachineFilter::environment(environment_id.clone());
        if let Some(existing) = self.list_machines(&filter).try_next().await? {
            info!(environment = %environment_id, machine = %existing.id, "reusing existing deployment");
            return self.await_available(&existing.id).await;
        }

        let key_pair = self.ensure_key_pair().await?;
        let name = manifest::deployment_name(environment_id);
        let image = hints.image.as_deref().unwrap_or(self.config.image.as_str());
        let body = manifest::deployment(&manifest::DeploymentSpec {
            name: &name,
            environment_id,
            image,
            key_pair: &key_pair,
            instance_type: hints.instance_type.as_deref(),
        });
        match self.client.create_deployment(&name, &body).await? {
            Created::New(_) => {
                info!(environment = %environment_id, machine = %name, "created deployment");
            }
            Created::AlreadyExists => {
                info!(environment = %environment_id, machine = %name, "deployment created concurrently");
            }
        }
        self.await_available(&name).await
    }

    async fn delete_machine(
        &self,
        machine: &Machine,
        options: DeleteOptions,
    ) -> Result<bool, DriverError> {
        if !self.client.delete_deployment(&machine.id).await? {
            return Ok(false);
        }
        info!(machine = %machine.id, "deletion accepted");
        if options.wait {
            self.wait_until_gone("machine", &machine.id, || async {
                Ok::<_, DriverError>(self.client.get_deployment(&machine.id).await?.is_some())
            })
            .await?;
        }
        Ok(true)
    }

    async fn delete_key_pair(
        &self,
        key_pair: &KeyPair,
        options: DeleteOptions,
    ) -> Result<bool, DriverError> {
        if !self.client.delete_secret(&key_pair.id).await? {
            return Ok(false);
        }
        if options.wait {
            self.wait_until_gone("key-pair", &key_pair.id, || async {
                Ok::<_, DriverError>(self.client.get_secret(&key_pair.id).await?.is_some())
            })
            .await?;
        }
        Ok(true)
    }
}

impl MachineBackend for KubeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kube
    }

    fn provision<'a>(
        &'a self,
        environment_id: &'a EnvironmentId,
        hints: &'a SizingHints,
    ) -> BackendFuture<'a, Machine> {
        Box::pin(self.provision_machine(environment_id, hints))
    }

    fn list_machines<'a>(&'a self, filter: &'a MachineFilter) -> ResourceStream<'a, Machine> {
        let machines = match filter.environment_id.as_ref() {
            Some(environment_id) => self
                .deployments_matching(manifest::environment_selector(environment_id))
                .and_then(move |machine| self.with_pod_address(machine))
                .boxed(),
            None => self.deployments_matching(manifest::managed_selector()),
        };
        machines
            .try_filter(move |machine| futures::future::ready(filter.matches(machine)))
            .boxed()
    }

    fn list_deletable_resources(
        &self,
        kinds: ResourceKinds,
    ) -> ResourceStream<'_, DeletableResource> {
        let machines = if kinds.machines {
            self.deployments_matching(manifest::managed_selector())
                .map_ok(DeletableResource::Machine)
                .boxed()
        } else {
            stream::empty().boxed()
        };
        let key_pairs = if kinds.key_pairs {
            self.key_pairs().map_ok(DeletableResource::KeyPair).boxed()
        } else {
            stream::empty().boxed()
        };
        machines.chain(key_pairs).boxed()
    }

    fn delete_resource<'a>(
        &'a self,
        resource: &'a DeletableResource,
        options: DeleteOptions,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let existed = match resource {
                DeletableResource::Machine(machine) => self.delete_machine(machine, options).await?,
                DeletableResource::KeyPair(key_pair) => {
                    self.delete_key_pair(key_pair, options).await?
                }
                DeletableResource::Snapshot(_) => false,
            };
            if existed {
                Ok(())
            } else {
                options.absent(resource)
            }
        })
    }

    fn create_snapshot<'a>(&'a self, _machine: &'a Machine) -> BackendFuture<'a, Snapshot> {
        Box::pin(async {
            Err(DriverError::Configuration(String::from(
                "snapshots are not supported by the kube backend",
            )))
        })
    }

    fn connection_params(&self, machine: &Machine) -> Result<ConnectionParams, DriverError> {
        Ok(ConnectionParams {
            machine_id: machine.id.clone(),
            address: None,
            auth: AuthMethod::KubeExec {
                namespace: machine.region.clone(),
                deployment: machine.id.clone(),
                container: manifest::CONTAINER_NAME.to_owned(),
                context: self.config.context.clone(),
            },
            interactive: true,
        })
    }
}
