//! In-process backend holding its state in memory.
//!
//! The fake is a correct, non-networked implementation of the backend
//! contract. Tests script failures per operation with
//! [`FakeBackend::fail_next`]; every error kind of the taxonomy can be
//! injected. Machines it provisions are reached through the local shell.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use tracing::debug;

use crate::backend::{
    BackendFuture, BackendKind, DeleteOptions, MachineBackend, MachineFilter, ResourceStream,
};
use crate::error::DriverError;
use crate::resource::{
    AuthMethod, ConnectionParams, DeletableResource, EnvironmentId, KeyPair, Machine,
    ResourceKinds, SizingHints, Snapshot,
};

const FAKE_REGION: &str = "local";
const FAKE_INSTANCE_TYPE: &str = "fake-small";
const FAKE_SNAPSHOT_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Operations that accept injected failures.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FakeOperation {
    /// [`MachineBackend::provision`].
    Provision,
    /// [`MachineBackend::list_machines`].
    ListMachines,
    /// [`MachineBackend::list_deletable_resources`].
    ListResources,
    /// [`MachineBackend::delete_resource`].
    Delete,
    /// [`MachineBackend::create_snapshot`].
    Snapshot,
    /// [`MachineBackend::connection_params`].
    ConnectionParams,
}

type DeleteHook = Arc<dyn Fn(&DeletableResource) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    next_id: u64,
    machines: BTreeMap<String, Machine>,
    snapshots: BTreeMap<String, Snapshot>,
    key_pairs: BTreeMap<String, KeyPair>,
    failures: HashMap<FakeOperation, VecDeque<DriverError>>,
    created_machines: u32,
    deleted: Vec<String>,
    on_delete: Option<DeleteHook>,
}

impl std::fmt::Debug for FakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeState")
            .field("machines", &self.machines.len())
            .field("snapshots", &self.snapshots.len())
            .field("key_pairs", &self.key_pairs.len())
            .field("deleted", &self.deleted)
            .finish_non_exhaustive()
    }
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("fake-{prefix}-{}", self.next_id)
    }

    fn take_failure(&mut self, operation: FakeOperation) -> Option<DriverError> {
        self.failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
    }
}

/// Backend whose provider is a map in memory. Clones share state.
#[derive(Clone, Debug)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
    profile: String,
    batch_only: bool,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new("default")
    }
}

impl FakeBackend {
    /// Creates an empty fake for the given profile.
    #[must_use]
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            profile: profile.into(),
            batch_only: false,
        }
    }

    /// Makes connection params advertise batch-only execution.
    #[must_use]
    pub const fn batch_only(mut self) -> Self {
        self.batch_only = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `error` to be returned by the next call to `operation`.
    pub fn fail_next(&self, operation: FakeOperation, error: DriverError) {
        self.fail_times(operation, error, 1);
    }

    /// Queues `error` for the next `times` calls to `operation`.
    pub fn fail_times(&self, operation: FakeOperation, error: DriverError, times: usize) {
        let mut state = self.state();
        let queue = state.failures.entry(operation).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Number of machines actually created (reuse does not count).
    #[must_use]
    pub fn created_machines(&self) -> u32 {
        self.state().created_machines
    }

    /// Calls `hook` with every resource just before it is deleted, so
    /// tests can check what else has already happened by then.
    pub fn on_delete(&self, hook: impl Fn(&DeletableResource) + Send + Sync + 'static) {
        self.state().on_delete = Some(Arc::new(hook));
    }

    /// Ids deleted so far, in deletion order.
    #[must_use]
    pub fn deleted_ids(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    /// Adds a machine that exists at the provider without an environment tag.
    pub fn insert_untagged_machine(&self) -> Machine {
        self.insert_machine(None)
    }

    /// Adds a running machine for `environment_id` without going through
    /// provisioning.
    pub fn insert_machine(&self, environment_id: Option<EnvironmentId>) -> Machine {
        let mut state = self.state();
        let id = state.next_id("machine");
        let machine = Machine {
            id: id.clone(),
            environment_id,
            created_at: Utc::now(),
            address: None,
            region: FAKE_REGION.to_owned(),
            instance_type: Some(FAKE_INSTANCE_TYPE.to_owned()),
            status: String::from("running"),
            key_pair_id: None,
        };
        state.machines.insert(id, machine.clone());
        machine
    }

    /// Adds a snapshot.
    pub fn insert_snapshot(&self, environment_id: Option<EnvironmentId>) -> Snapshot {
        let mut state = self.state();
        let id = state.next_id("snapshot");
        let snapshot = Snapshot {
            id: id.clone(),
            environment_id,
            created_at: Utc::now(),
            size_bytes: Some(FAKE_SNAPSHOT_SIZE),
            region: FAKE_REGION.to_owned(),
        };
        state.snapshots.insert(id, snapshot.clone());
        snapshot
    }

    /// Adds a key pair with the given name.
    pub fn insert_key_pair(&self, name: impl Into<String>) -> KeyPair {
        let mut state = self.state();
        let id = state.next_id("key");
        let key_pair = KeyPair {
            id: id.clone(),
            name: name.into(),
            fingerprint: Some(format!("SHA256:{id}")),
            created_at: Some(Utc::now()),
        };
        state.key_pairs.insert(id, key_pair.clone());
        key_pair
    }

    fn key_pair_name(&self) -> String {
        format!("prevue-{}", self.profile)
    }

    fn ensure_key_pair(&self, state: &mut FakeState) -> String {
        let name = self.key_pair_name();
        if let Some(existing) = state.key_pairs.values().find(|key| key.name == name) {
            return existing.id.clone();
        }
        let id = state.next_id("key");
        state.key_pairs.insert(
            id.clone(),
            KeyPair {
                id: id.clone(),
                name,
                fingerprint: Some(format!("SHA256:{id}")),
                created_at: Some(Utc::now()),
            },
        );
        id
    }

    fn provision_now(
        &self,
        environment_id: &EnvironmentId,
        hints: &SizingHints,
    ) -> Result<Machine, DriverError> {
        let mut state = self.state();
        if let Some(error) = state.take_failure(FakeOperation::Provision) {
            return Err(error);
        }
        if let Some(existing) = state
            .machines
            .values()
            .find(|machine| machine.belongs_to(environment_id))
        {
            debug!(environment = %environment_id, machine = %existing.id, "reusing fake machine");
            return Ok(existing.clone());
        }

        let key_pair_id = self.ensure_key_pair(&mut state);
        let id = state.next_id("machine");
        let machine = Machine {
            id: id.clone(),
            environment_id: Some(environment_id.clone()),
            created_at: Utc::now(),
            address: None,
            region: FAKE_REGION.to_owned(),
            instance_type: Some(
                hints
                    .instance_type
                    .clone()
                    .unwrap_or_else(|| FAKE_INSTANCE_TYPE.to_owned()),
            ),
            status: String::from("running"),
            key_pair_id: Some(key_pair_id),
        };
        state.machines.insert(id, machine.clone());
        state.created_machines += 1;
        Ok(machine)
    }

    fn delete_now(
        &self,
        resource: &DeletableResource,
        options: DeleteOptions,
    ) -> Result<(), DriverError> {
        let observer = self.state().on_delete.clone();
        if let Some(hook) = observer {
            hook(resource);
        }
        let mut state = self.state();
        if let Some(error) = state.take_failure(FakeOperation::Delete) {
            return Err(error);
        }
        let id = resource.id();
        let removed = match resource {
            DeletableResource::Machine(_) => state.machines.remove(id).is_some(),
            DeletableResource::Snapshot(_) => state.snapshots.remove(id).is_some(),
            DeletableResource::KeyPair(_) => state.key_pairs.remove(id).is_some(),
        };
        if removed {
            state.deleted.push(id.to_owned());
            Ok(())
        } else {
            drop(state);
            options.absent(resource)
        }
    }

    fn snapshot_now(&self, machine: &Machine) -> Result<Snapshot, DriverError> {
        let mut state = self.state();
        if let Some(error) = state.take_failure(FakeOperation::Snapshot) {
            return Err(error);
        }
        if !state.machines.contains_key(&machine.id) {
            return Err(DriverError::not_found("machine", machine.id.clone()));
        }
        let id = state.next_id("snapshot");
        let snapshot = Snapshot {
            id: id.clone(),
            environment_id: machine.environment_id.clone(),
            created_at: Utc::now(),
            size_bytes: Some(FAKE_SNAPSHOT_SIZE),
            region: machine.region.clone(),
        };
        state.snapshots.insert(id, snapshot.clone());
        Ok(snapshot)
    }

    fn resources_now(&self, kinds: ResourceKinds) -> Result<Vec<DeletableResource>, DriverError> {
        let mut state = self.state();
        if let Some(error) = state.take_failure(FakeOperation::ListResources) {
            return Err(error);
        }
        let mut resources = Vec::new();
        if kinds.machines {
            resources.extend(state.machines.values().cloned().map(DeletableResource::Machine));
        }
        if kinds.snapshots {
            resources.extend(
                state
                    .snapshots
                    .values()
                    .cloned()
                    .map(DeletableResource::Snapshot),
            );
        }
        if kinds.key_pairs {
            resources.extend(state.key_pairs.values().cloned().map(DeletableResource::KeyPair));
        }
        Ok(resources)
    }
}

fn into_stream<'a, T: Send + 'a>(items: Result<Vec<T>, DriverError>) -> ResourceStream<'a, T> {
    match items {
        Ok(items) => stream::iter(items.into_iter().map(Ok)).boxed(),
        Err(error) => stream::once(async move { Err(error) }).boxed(),
    }
}

impl MachineBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fake
    }

    fn provision<'a>(
        &'a self,
        environment_id: &'a EnvironmentId,
        hints: &'a SizingHints,
    ) -> BackendFuture<'a, Machine> {
        Box::pin(async move { self.provision_now(environment_id, hints) })
    }

    fn list_machines<'a>(&'a self, filter: &'a MachineFilter) -> ResourceStream<'a, Machine> {
        let listed = {
            let mut state = self.state();
            state
                .take_failure(FakeOperation::ListMachines)
                .map_or_else(
                    || {
                        Ok(state
                            .machines
                            .values()
                            .filter(|machine| filter.matches(machine))
                            .cloned()
                            .collect())
                    },
                    Err,
                )
        };
        into_stream(listed)
    }

    fn list_deletable_resources(
        &self,
        kinds: ResourceKinds,
    ) -> ResourceStream<'_, DeletableResource> {
        into_stream(self.resources_now(kinds))
    }

    fn delete_resource<'a>(
        &'a self,
        resource: &'a DeletableResource,
        options: DeleteOptions,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move { self.delete_now(resource, options) })
    }

    fn create_snapshot<'a>(&'a self, machine: &'a Machine) -> BackendFuture<'a, Snapshot> {
        Box::pin(async move { self.snapshot_now(machine) })
    }

    fn connection_params(&self, machine: &Machine) -> Result<ConnectionParams, DriverError> {
        if let Some(error) = self.state().take_failure(FakeOperation::ConnectionParams) {
            return Err(error);
        }
        Ok(ConnectionParams {
            machine_id: machine.id.clone(),
            address: machine.address.clone(),
            auth: AuthMethod::Local,
            interactive: !self.batch_only,
        })
    }
}
