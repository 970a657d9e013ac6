//! Wire types and raw HTTP calls for the Scaleway Instances and IAM APIs.
//!
//! `scaleway-rs` covers image lookup and power actions; listing with tag
//! filters, snapshots and SSH keys go through `reqwest` directly.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DriverError;

use super::error::{self, Target};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub(super) const INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
pub(super) const IAM_API_BASE: &str = "https://api.scaleway.com/iam/v1alpha1";
pub(super) const PAGE_SIZE: u32 = 50;

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct IpRecord {
    pub(super) address: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct VolumeRecord {
    pub(super) id: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct ServerRecord {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) state: String,
    #[serde(default)]
    pub(super) tags: Vec<String>,
    #[serde(default)]
    pub(super) commercial_type: Option<String>,
    #[serde(default)]
    pub(super) creation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub(super) public_ip: Option<IpRecord>,
    #[serde(default)]
    pub(super) public_ips: Vec<IpRecord>,
    #[serde(default)]
    pub(super) allowed_actions: Vec<String>,
    #[serde(default)]
    pub(super) volumes: BTreeMap<String, VolumeRecord>,
    #[serde(default)]
    pub(super) zone: Option<String>,
}

impl ServerRecord {
    /// First routed or legacy public address.
    pub(super) fn public_address(&self) -> Option<&str> {
        self.public_ips
            .first()
            .or(self.public_ip.as_ref())
            .map(|ip| ip.address.as_str())
    }

    /// Volume mounted as the root disk.
    pub(super) fn root_volume_id(&self) -> Option<&str> {
        self.volumes.get("0").map(|volume| volume.id.as_str())
    }
}

#[derive(Deserialize)]
struct ServerList {
    #[serde(default)]
    servers: Vec<ServerRecord>,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ServerRecord,
}

#[derive(Serialize)]
pub(super) struct CreateServerRequest {
    pub(super) name: String,
    pub(super) commercial_type: String,
    pub(super) image: String,
    pub(super) project: String,
    pub(super) routed_ip_enabled: bool,
    pub(super) dynamic_ip_required: bool,
    pub(super) tags: Vec<String>,
    pub(super) stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) organization: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct SnapshotRecord {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) state: String,
    #[serde(default)]
    pub(super) tags: Vec<String>,
    #[serde(default)]
    pub(super) size: Option<u64>,
    #[serde(default)]
    pub(super) creation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub(super) zone: Option<String>,
}

#[derive(Deserialize)]
struct SnapshotList {
    #[serde(default)]
    snapshots: Vec<SnapshotRecord>,
}

#[derive(Deserialize)]
struct SnapshotEnvelope {
    snapshot: SnapshotRecord,
}

#[derive(Serialize)]
pub(super) struct CreateSnapshotRequest {
    pub(super) name: String,
    pub(super) volume_id: String,
    pub(super) project: String,
    pub(super) tags: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct SshKeyRecord {
    pub(super) id: String,
    pub(super) name: String,
    #[serde(default)]
    pub(super) fingerprint: Option<String>,
    #[serde(default)]
    pub(super) created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct SshKeyList {
    #[serde(default)]
    ssh_keys: Vec<SshKeyRecord>,
}

#[derive(Serialize)]
pub(super) struct CreateSshKeyRequest {
    pub(super) name: String,
    pub(super) public_key: String,
    pub(super) project_id: String,
}

/// Thin authenticated client over the raw endpoints.
#[derive(Clone)]
pub(super) struct ApiClient {
    secret_key: String,
    instance_base: String,
    iam_base: String,
}

impl ApiClient {
    pub(super) fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            instance_base: INSTANCE_API_BASE.to_owned(),
            iam_base: IAM_API_BASE.to_owned(),
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        HTTP_CLIENT
            .request(method, url)
            .header("X-Auth-Token", &self.secret_key)
    }

    /// Sends a request, returning `None` for 404 and the body otherwise.
    async fn send(
        &self,
        builder: RequestBuilder,
        target: Target<'_>,
    ) -> Result<Option<Vec<u8>>, DriverError> {
        let response = builder.send().await.map_err(|err| error::transport(&err))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| error::transport(&err))?;
        if status.is_success() {
            return Ok(Some(body.to_vec()));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Err(error::from_response(status.as_u16(), &body, target))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        target: Target<'_>,
    ) -> Result<Option<T>, DriverError> {
        match self.send(builder, target).await? {
            Some(body) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|err| error::transport(&err)),
            None => Ok(None),
        }
    }

    async fn fetch_required<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        target: Target<'_>,
    ) -> Result<T, DriverError> {
        self.fetch(builder, target)
            .await?
            .ok_or_else(|| DriverError::not_found(target.kind, target.id))
    }

    pub(super) async fn list_servers_page(
        &self,
        zone: &str,
        name_prefix: &str,
        page: u32,
    ) -> Result<Vec<ServerRecord>, DriverError> {
        debug!(zone, page, "listing Scaleway servers");
        let url = format!("{}/zones/{zone}/servers", self.instance_base);
        let builder = self.request(Method::GET, &url).query(&[
            ("name", name_prefix.to_owned()),
            ("page", page.to_string()),
            ("per_page", PAGE_SIZE.to_string()),
        ]);
        let list: ServerList = self
            .fetch_required(builder, Target::new("zone", zone))
            .await?;
        Ok(list.servers)
    }

    pub(super) async fn get_server(
        &self,
        zone: &str,
        id: &str,
    ) -> Result<Option<ServerRecord>, DriverError> {
        let url = format!("{}/zones/{zone}/servers/{id}", self.instance_base);
        let envelope: Option<ServerEnvelope> = self
            .fetch(self.request(Method::GET, &url), Target::new("machine", id))
            .await?;
        Ok(envelope.map(|found| found.server))
    }

    pub(super) async fn create_server(
        &self,
        zone: &str,
        payload: &CreateServerRequest,
    ) -> Result<ServerRecord, DriverError> {
        debug!(zone, name = %payload.name, "creating Scaleway server");
        let url = format!("{}/zones/{zone}/servers", self.instance_base);
        let envelope: ServerEnvelope = self
            .fetch_required(
                self.request(Method::POST, &url).json(payload),
                Target::new("machine", &payload.name),
            )
            .await?;
        Ok(envelope.server)
    }

    pub(super) async fn list_snapshots_page(
        &self,
        zone: &str,
        tag: &str,
        page: u32,
    ) -> Result<Vec<SnapshotRecord>, DriverError> {
        debug!(zone, page, "listing Scaleway snapshots");
        let url = format!("{}/zones/{zone}/snapshots", self.instance_base);
        let builder = self.request(Method::GET, &url).query(&[
            ("tags", tag.to_owned()),
            ("page", page.to_string()),
            ("per_page", PAGE_SIZE.to_string()),
        ]);
        let list: SnapshotList = self
            .fetch_required(builder, Target::new("zone", zone))
            .await?;
        Ok(list.snapshots)
    }

    pub(super) async fn get_snapshot(
        &self,
        zone: &str,
        id: &str,
    ) -> Result<Option<SnapshotRecord>, DriverError> {
        let url = format!("{}/zones/{zone}/snapshots/{id}", self.instance_base);
        let envelope: Option<SnapshotEnvelope> = self
            .fetch(self.request(Method::GET, &url), Target::new("snapshot", id))
            .await?;
        Ok(envelope.map(|found| found.snapshot))
    }

    pub(super) async fn create_snapshot(
        &self,
        zone: &str,
        payload: &CreateSnapshotRequest,
    ) -> Result<SnapshotRecord, DriverError> {
        debug!(zone, volume = %payload.volume_id, "creating Scaleway snapshot");
        let url = format!("{}/zones/{zone}/snapshots", self.instance_base);
        let envelope: SnapshotEnvelope = self
            .fetch_required(
                self.request(Method::POST, &url).json(payload),
                Target::new("machine volume", &payload.volume_id),
            )
            .await?;
        Ok(envelope.snapshot)
    }

    /// Returns `false` when the snapshot was already gone.
    pub(super) async fn delete_snapshot(&self, zone: &str, id: &str) -> Result<bool, DriverError> {
        let url = format!("{}/zones/{zone}/snapshots/{id}", self.instance_base);
        let deleted = self
            .send(self.request(Method::DELETE, &url), Target::new("snapshot", id))
            .await?;
        Ok(deleted.is_some())
    }

    pub(super) async fn list_ssh_keys_page(
        &self,
        project_id: &str,
        name: &str,
        page: u32,
    ) -> Result<Vec<SshKeyRecord>, DriverError> {
        debug!(page, "listing Scaleway SSH keys");
        let url = format!("{}/ssh-keys", self.iam_base);
        let builder = self.request(Method::GET, &url).query(&[
            ("project_id", project_id.to_owned()),
            ("name", name.to_owned()),
            ("page", page.to_string()),
            ("page_size", PAGE_SIZE.to_string()),
        ]);
        let list: SshKeyList = self
            .fetch_required(builder, Target::new("project", project_id))
            .await?;
        Ok(list.ssh_keys)
    }

    pub(super) async fn get_ssh_key(&self, id: &str) -> Result<Option<SshKeyRecord>, DriverError> {
        let url = format!("{}/ssh-keys/{id}", self.iam_base);
        self.fetch(self.request(Method::GET, &url), Target::new("key-pair", id))
            .await
    }

    pub(super) async fn create_ssh_key(
        &self,
        payload: &CreateSshKeyRequest,
    ) -> Result<SshKeyRecord, DriverError> {
        debug!(name = %payload.name, "registering Scaleway SSH key");
        let url = format!("{}/ssh-keys", self.iam_base);
        self.fetch_required(
            self.request(Method::POST, &url).json(payload),
            Target::new("key-pair", &payload.name),
        )
        .await
    }

    /// Returns `false` when the key was already gone.
    pub(super) async fn delete_ssh_key(&self, id: &str) -> Result<bool, DriverError> {
        let url = format!("{}/ssh-keys/{id}", self.iam_base);
        let deleted = self
            .send(self.request(Method::DELETE, &url), Target::new("key-pair", id))
            .await?;
        Ok(deleted.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_records_expose_routed_addresses_and_root_volume() {
        let json = r#"{
            "id": "srv-1",
            "name": "prevue-demo",
            "state": "running",
            "tags": ["prevue", "prevue-env-demo"],
            "commercial_type": "DEV1-S",
            "creation_date": "2026-01-02T03:04:05.000000+00:00",
            "public_ip": null,
            "public_ips": [{"address": "51.15.0.10"}],
            "allowed_actions": ["poweroff", "terminate"],
            "volumes": {"0": {"id": "vol-1"}}
        }"#;
        let server: ServerRecord = serde_json::from_str(json).expect("decodes");
        assert_eq!(server.public_address(), Some("51.15.0.10"));
        assert_eq!(server.root_volume_id(), Some("vol-1"));
    }

    #[test]
    fn sparse_server_records_decode() {
        let json = r#"{"id": "srv-2", "name": "prevue-x", "state": "stopped"}"#;
        let server: ServerRecord = serde_json::from_str(json).expect("decodes");
        assert!(server.public_address().is_none());
        assert!(server.tags.is_empty());
    }
}
