//! Cloud VM backend on Scaleway Instances.
//!
//! Machines are servers tagged `prevue` plus `prevue-env-<id>`. Servers named
//! `prevue-*` that lost their environment tag still surface, untagged, so a
//! purge can reclaim them. Snapshots capture the root volume; key pairs are
//! IAM SSH keys named `prevue-<profile>`.

mod api;
mod error;
mod image;
mod wait;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use scaleway_rs::ScalewayApi;
use tracing::{debug, info};

use crate::backend::{
    BackendFuture, BackendKind, DeleteOptions, MachineBackend, MachineFilter, ResourceStream,
};
use crate::config::ScalewayConfig;
use crate::error::DriverError;
use crate::resource::{
    Address, AuthMethod, ConnectionParams, DeletableResource, EnvironmentId, KeyPair, Machine,
    ResourceKinds, SizingHints, Snapshot,
};

use api::{
    ApiClient, CreateServerRequest, CreateSnapshotRequest, CreateSshKeyRequest, PAGE_SIZE,
    ServerRecord, SnapshotRecord, SshKeyRecord,
};
use error::Target;
use image::ImageQuery;

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_SSH_USER: &str = "root";
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const DELETE_TIMEOUT: Duration = Duration::from_secs(180);

const MANAGED_TAG: &str = "prevue";
const NAME_PREFIX: &str = "prevue-";
const ENV_TAG_PREFIX: &str = "prevue-env-";
const KEY_TAG_PREFIX: &str = "prevue-key-";

/// Backend that provisions machines through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayBackend {
    api: ScalewayApi,
    client: ApiClient,
    config: ScalewayConfig,
    profile: String,
    ssh_port: u16,
    poll_interval: Duration,
    wait_timeout: Duration,
    delete_timeout: Duration,
}

impl ScalewayBackend {
    /// Constructs a new backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Configuration`] when the provided configuration
    /// fails validation.
    pub fn new(config: ScalewayConfig, profile: impl Into<String>) -> Result<Self, DriverError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            client: ApiClient::new(config.secret_key.clone()),
            config,
            profile: profile.into(),
            ssh_port: DEFAULT_SSH_PORT,
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
            delete_timeout: DELETE_TIMEOUT,
        })
    }

    fn zone(&self) -> &str {
        &self.config.default_zone
    }

    fn key_pair_name(&self) -> String {
        format!("{NAME_PREFIX}{}", self.profile)
    }

    fn server_tags(environment_id: &EnvironmentId, key_pair: Option<&KeyPair>) -> Vec<String> {
        let mut tags = vec![
            MANAGED_TAG.to_owned(),
            format!("{ENV_TAG_PREFIX}{environment_id}"),
        ];
        if let Some(key) = key_pair {
            tags.push(format!("{KEY_TAG_PREFIX}{}", key.id));
        }
        tags
    }

    /// Private key matching the configured public key, by the `.pub`
    /// convention.
    fn identity_file(&self) -> Option<String> {
        self.config
            .ssh_public_key_file
            .as_deref()
            .and_then(|path| path.strip_suffix(".pub"))
            .map(str::to_owned)
    }

    fn machine_from_server(&self, server: ServerRecord) -> Option<Machine> {
        let managed = server.tags.iter().any(|tag| tag == MANAGED_TAG);
        if !managed && !server.name.starts_with(NAME_PREFIX) {
            return None;
        }
        let environment_id = tag_value(&server.tags, ENV_TAG_PREFIX)
            .and_then(|raw| EnvironmentId::normalize(raw).ok());
        let key_pair_id = tag_value(&server.tags, KEY_TAG_PREFIX).map(str::to_owned);
        let address = server
            .public_address()
            .map(|host| Address::new(host, self.ssh_port));
        Some(Machine {
            environment_id,
            created_at: server.creation_date.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            address,
            region: server.zone.unwrap_or_else(|| self.zone().to_owned()),
            instance_type: server.commercial_type,
            status: server.state,
            key_pair_id,
            id: server.id,
        })
    }

    fn snapshot_from_record(&self, record: SnapshotRecord) -> Snapshot {
        Snapshot {
            environment_id: tag_value(&record.tags, ENV_TAG_PREFIX)
                .and_then(|raw| EnvironmentId::normalize(raw).ok()),
            created_at: record.creation_date.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            size_bytes: record.size,
            region: record.zone.unwrap_or_else(|| self.zone().to_owned()),
            id: record.id,
        }
    }

    async fn power_on_if_needed(&self, server: &ServerRecord) -> Result<(), DriverError> {
        if server.state == "running" || server.state == "starting" {
            return Ok(());
        }

        if server.allowed_actions.iter().any(|action| action == "poweron") {
            self.api
                .perform_instance_action_async(self.zone(), &server.id, "poweron")
                .await
                .map_err(|err| error::from_sdk(&err, Target::new("machine", &server.id)))?;
            return Ok(());
        }

        Err(DriverError::Provision(format!(
            "machine {} in state {} cannot be powered on",
            server.id, server.state
        )))
    }

    async fn await_ready(&self, id: &str) -> Result<Machine, DriverError> {
        let (server, address) = self.wait_for_address(self.zone(), id).await?;
        self.wait_for_ssh_ready(id, &address).await?;
        let mut machine = self
            .machine_from_server(server)
            .ok_or_else(|| DriverError::not_found("machine", id))?;
        machine.address = Some(address);
        Ok(machine)
    }

    async fn find_key_pair(&self, name: &str) -> Result<Option<KeyPair>, DriverError> {
        let keys = self
            .client
            .list_ssh_keys_page(&self.config.default_project_id, name, 1)
            .await?;
        Ok(keys
            .into_iter()
            .find(|key| key.name == name)
            .map(key_pair_from_record))
    }

    /// Returns the profile key pair, registering it on first use when a
    /// public key is configured.
    async fn ensure_key_pair(&self) -> Result<Option<KeyPair>, DriverError> {
        let name = self.key_pair_name();
        if let Some(existing) = self.find_key_pair(&name).await? {
            return Ok(Some(existing));
        }
        let Some(path) = self.config.ssh_public_key_file.as_deref() else {
            debug!(%name, "no public key configured; relying on project keys");
            return Ok(None);
        };
        let public_key = crate::fs::read_to_string(path).map_err(|message| {
            DriverError::Configuration(format!("cannot read SSH public key: {message}"))
        })?;
        let record = self
            .client
            .create_ssh_key(&CreateSshKeyRequest {
                name: name.clone(),
                public_key: public_key.trim().to_owned(),
                project_id: self.config.default_project_id.clone(),
            })
            .await?;
        info!(key_pair = %record.id, %name, "registered key pair");
        Ok(Some(key_pair_from_record(record)))
    }

    async fn provision_machine(
        &self,
        environment_id: &EnvironmentId,
        hints: &SizingHints,
    ) -> Result<Machine, DriverError> {
        let filter = MachineFilter::environment(environment_id.clone());
        let existing = self.list_machines(&filter).try_next().await?;
        if let Some(machine) = existing {
            info!(environment = %environment_id, machine = %machine.id, "reusing existing machine");
            if let Some(server) = self.client.get_server(self.zone(), &machine.id).await? {
                self.power_on_if_needed(&server).await?;
            }
            return self.await_ready(&machine.id).await;
        }

        let key_pair = self.ensure_key_pair().await?;
        let label = hints
            .image
            .as_deref()
            .unwrap_or(self.config.default_image.as_str());
        let image_id = self
            .resolve_image_id(&ImageQuery {
                label,
                arch: &self.config.default_architecture,
                zone: self.zone(),
                project_id: &self.config.default_project_id,
                organisation_id: self.config.default_organization_id.as_deref(),
            })
            .await?;

        let payload = CreateServerRequest {
            name: format!("{NAME_PREFIX}{environment_id}"),
            commercial_type: hints
                .instance_type
                .clone()
                .unwrap_or_else(|| self.config.default_instance_type.clone()),
            image: image_id,
            project: self.config.default_project_id.clone(),
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: Self::server_tags(environment_id, key_pair.as_ref()),
            stopped: true,
            organization: self.config.default_organization_id.clone(),
        };
        let server = self.client.create_server(self.zone(), &payload).await?;
        info!(environment = %environment_id, machine = %server.id, "created machine");
        self.power_on_if_needed(&server).await?;
        self.await_ready(&server.id).await
    }

    fn paged<'a, T, F, Fut>(fetch: F) -> BoxStream<'a, Result<T, DriverError>>
    where
        T: Send + 'a,
        F: Fn(u32) -> Fut + Send + 'a,
        Fut: Future<Output = Result<Vec<T>, DriverError>> + Send + 'a,
    {
        stream::try_unfold((fetch, Some(1_u32)), |(fetch, page)| async move {
            let Some(page) = page else {
                return Ok::<_, DriverError>(None);
            };
            let items = fetch(page).await?;
            let full = u32::try_from(items.len()).is_ok_and(|len| len >= PAGE_SIZE);
            let next = full.then_some(page + 1);
            Ok(Some((items, (fetch, next))))
        })
        .map_ok(|items| stream::iter(items.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    fn all_machines(&self) -> ResourceStream<'_, Machine> {
        let zone = self.zone();
        Self::paged(move |page| self.client.list_servers_page(zone, NAME_PREFIX, page))
            .try_filter_map(move |server| futures::future::ready(Ok(self.machine_from_server(server))))
            .boxed()
    }

    fn all_snapshots(&self) -> ResourceStream<'_, Snapshot> {
        let zone = self.zone();
        Self::paged(move |page| self.client.list_snapshots_page(zone, MANAGED_TAG, page))
            .map_ok(move |record| self.snapshot_from_record(record))
            .boxed()
    }

    fn all_key_pairs(&self) -> ResourceStream<'_, KeyPair> {
        let project = self.config.default_project_id.as_str();
        Self::paged(move |page| self.client.list_ssh_keys_page(project, NAME_PREFIX, page))
            .try_filter(|record| futures::future::ready(record.name.starts_with(NAME_PREFIX)))
            .map_ok(key_pair_from_record)
            .boxed()
    }

    async fn delete_machine(
        &self,
        machine: &Machine,
        options: DeleteOptions,
    ) -> Result<bool, DriverError> {
        let zone = self.zone();
        let Some(server) = self.client.get_server(zone, &machine.id).await? else {
            return Ok(false);
        };
        let target = Target::new("machine", &machine.id);
        if server.allowed_actions.iter().any(|action| action == "terminate") {
            self.api
                .perform_instance_action_async(zone, &server.id, "terminate")
                .await
                .map_err(|err| error::from_sdk(&err, target))?;
        } else {
            self.api
                .delete_instance_async(zone, &server.id)
                .await
                .map_err(|err| error::from_sdk(&err, target))?;
        }
        info!(machine = %machine.id, "deletion accepted");
        if options.wait {
            self.wait_until_gone("machine", &machine.id, || async {
                Ok::<_, DriverError>(self.client.get_server(zone, &machine.id).await?.is_some())
            })
            .await?;
        }
        Ok(true)
    }

    async fn delete_snapshot(
        &self,
        snapshot: &Snapshot,
        options: DeleteOptions,
    ) -> Result<bool, DriverError> {
        let zone = self.zone();
        if !self.client.delete_snapshot(zone, &snapshot.id).await? {
            return Ok(false);
        }
        if options.wait {
            self.wait_until_gone("snapshot", &snapshot.id, || async {
                Ok::<_, DriverError>(self.client.get_snapshot(zone, &snapshot.id).await?.is_some())
            })
            .await?;
        }
        Ok(true)
    }

    async fn delete_key_pair(&self, key_pair: &KeyPair) -> Result<bool, DriverError> {
        if self.client.get_ssh_key(&key_pair.id).await?.is_none() {
            return Ok(false);
        }
        self.client.delete_ssh_key(&key_pair.id).await
    }

    async fn snapshot_machine(&self, machine: &Machine) -> Result<Snapshot, DriverError> {
        let zone = self.zone();
        let server = self
            .client
            .get_server(zone, &machine.id)
            .await?
            .ok_or_else(|| DriverError::not_found("machine", machine.id.clone()))?;
        let volume_id = server.root_volume_id().ok_or_else(|| {
            DriverError::Configuration(format!("machine {} has no root volume", machine.id))
        })?;
        let label = machine
            .environment_id
            .as_ref()
            .map_or("untagged", EnvironmentId::as_str);
        let mut tags = vec![MANAGED_TAG.to_owned()];
        if let Some(environment_id) = &machine.environment_id {
            tags.push(format!("{ENV_TAG_PREFIX}{environment_id}"));
        }
        let record = self
            .client
            .create_snapshot(
                zone,
                &CreateSnapshotRequest {
                    name: format!("{NAME_PREFIX}{label}-{}", Utc::now().format("%Y%m%d%H%M%S")),
                    volume_id: volume_id.to_owned(),
                    project: self.config.default_project_id.clone(),
                    tags,
                },
            )
            .await?;
        let id = record.id.clone();
        self.wait_for_snapshot(&id, || async {
            Ok::<_, DriverError>(self
                .client
                .get_snapshot(zone, &id)
                .await?
                .map(|found| found.state))
        })
        .await?;
        info!(snapshot = %id, machine = %machine.id, "snapshot available");
        Ok(self.snapshot_from_record(record))
    }
}

fn tag_value<'a>(tags: &'a [String], prefix: &str) -> Option<&'a str> {
    tags.iter()
        .find_map(|tag| tag.strip_prefix(prefix))
        .filter(|value| !value.is_empty())
}

fn key_pair_from_record(record: SshKeyRecord) -> KeyPair {
    KeyPair {
        id: record.id,
        name: record.name,
        fingerprint: record.fingerprint,
        created_at: record.created_at,
    }
}

impl MachineBackend for ScalewayBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Scaleway
    }

    fn provision<'a>(
        &'a self,
        environment_id: &'a EnvironmentId,
        hints: &'a SizingHints,
    ) -> BackendFuture<'a, Machine> {
        Box::pin(self.provision_machine(environment_id, hints))
    }

    fn list_machines<'a>(&'a self, filter: &'a MachineFilter) -> ResourceStream<'a, Machine> {
        self.all_machines()
            .try_filter(move |machine| futures::future::ready(filter.matches(machine)))
            .boxed()
    }

    fn list_deletable_resources(
        &self,
        kinds: ResourceKinds,
    ) -> ResourceStream<'_, DeletableResource> {
        let machines = if kinds.machines {
            self.all_machines().map_ok(DeletableResource::Machine).boxed()
        } else {
            stream::empty().boxed()
        };
        let snapshots = if kinds.snapshots {
            self.all_snapshots().map_ok(DeletableResource::Snapshot).boxed()
        } else {
            stream::empty().boxed()
        };
        let key_pairs = if kinds.key_pairs {
            self.all_key_pairs().map_ok(DeletableResource::KeyPair).boxed()
        } else {
            stream::empty().boxed()
        };
        machines.chain(snapshots).chain(key_pairs).boxed()
    }

    fn delete_resource<'a>(
        &'a self,
        resource: &'a DeletableResource,
        options: DeleteOptions,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let existed = match resource {
                DeletableResource::Machine(machine) => self.delete_machine(machine, options).await?,
                DeletableResource::Snapshot(snapshot) => {
                    self.delete_snapshot(snapshot, options).await?
                }
                DeletableResource::KeyPair(key_pair) => self.delete_key_pair(key_pair).await?,
            };
            if existed {
                Ok(())
            } else {
                options.absent(resource)
            }
        })
    }

    fn create_snapshot<'a>(&'a self, machine: &'a Machine) -> BackendFuture<'a, Snapshot> {
        Box::pin(self.snapshot_machine(machine))
    }

    fn connection_params(&self, machine: &Machine) -> Result<ConnectionParams, DriverError> {
        let address = machine.address.clone().ok_or_else(|| {
            DriverError::Unreachable(format!("machine {} has no public address yet", machine.id))
        })?;
        Ok(ConnectionParams {
            machine_id: machine.id.clone(),
            address: Some(address),
            auth: AuthMethod::Ssh {
                user: DEFAULT_SSH_USER.to_owned(),
                identity_file: self.identity_file(),
            },
            interactive: true,
        })
    }
}

#[cfg(test)]
mod tests;
