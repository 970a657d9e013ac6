//! Minimal Kubernetes REST client: typed reads, JSON manifests for writes.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::KubeConfig;
use crate::error::DriverError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub(super) const PAGE_SIZE: u32 = 50;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(super) struct ObjectMeta {
    pub(super) name: String,
    #[serde(default)]
    pub(super) namespace: Option<String>,
    #[serde(default)]
    pub(super) labels: BTreeMap<String, String>,
    #[serde(default)]
    pub(super) creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub(super) deletion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct Container {
    pub(super) name: String,
    #[serde(default)]
    pub(super) image: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub(super) struct PodSpec {
    #[serde(default)]
    pub(super) containers: Vec<Container>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub(super) struct PodTemplate {
    #[serde(default)]
    pub(super) spec: PodSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub(super) struct DeploymentSpec {
    #[serde(default)]
    pub(super) template: PodTemplate,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(super) struct DeploymentStatus {
    #[serde(default)]
    pub(super) available_replicas: Option<i32>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct Deployment {
    pub(super) metadata: ObjectMeta,
    #[serde(default)]
    pub(super) spec: DeploymentSpec,
    #[serde(default)]
    pub(super) status: DeploymentStatus,
}

impl Deployment {
    pub(super) fn is_available(&self) -> bool {
        self.status.available_replicas.unwrap_or_default() > 0
    }

    pub(super) fn phase(&self) -> &'static str {
        if self.metadata.deletion_timestamp.is_some() {
            "terminating"
        } else if self.is_available() {
            "running"
        } else {
            "pending"
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(super) struct PodStatus {
    #[serde(default)]
    pub(super) phase: Option<String>,
    #[serde(default, rename = "podIP")]
    pub(super) pod_ip: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct Pod {
    pub(super) metadata: ObjectMeta,
    #[serde(default)]
    pub(super) status: PodStatus,
}

impl Pod {
    /// Cluster address of a running pod that is not being torn down.
    pub(super) fn serving_ip(&self) -> Option<&str> {
        if self.metadata.deletion_timestamp.is_some()
            || self.status.phase.as_deref() != Some("Running")
        {
            return None;
        }
        self.status.pod_ip.as_deref().filter(|ip| !ip.is_empty())
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct Secret {
    pub(super) metadata: ObjectMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ListMeta {
    #[serde(default, rename = "continue")]
    continue_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub(super) struct ObjectList<T> {
    #[serde(default)]
    pub(super) items: Vec<T>,
    #[serde(default)]
    metadata: ListMeta,
}

impl<T> ObjectList<T> {
    /// Continuation token for the next page, if any.
    pub(super) fn next_page(&self) -> Option<String> {
        self.metadata
            .continue_token
            .clone()
            .filter(|token| !token.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: String,
}

/// Outcome of a write that may collide with an existing object.
#[derive(Debug)]
pub(super) enum Created<T> {
    New(T),
    AlreadyExists,
}

/// Maps an API server failure response.
pub(super) fn normalize(status: u16, body: &[u8], kind: &str, id: &str) -> DriverError {
    let parsed: Status = serde_json::from_slice(body).unwrap_or_default();
    let message = if parsed.message.is_empty() {
        String::from_utf8_lossy(body).trim().to_owned()
    } else {
        parsed.message
    };
    let lowered = message.to_ascii_lowercase();
    match status {
        404 => DriverError::not_found(kind, id),
        403 if lowered.contains("exceeded quota") => DriverError::Quota(message),
        401 | 403 => DriverError::Configuration(format!(
            "the API server rejected the credentials: {message}"
        )),
        400 | 422 => DriverError::Configuration(format!("{kind} {id} rejected: {message}")),
        _ if parsed.reason == "AlreadyExists" => {
            DriverError::Provision(format!("{kind} {id} already exists"))
        }
        _ => DriverError::Provision(if message.is_empty() {
            format!("API server returned HTTP {status}")
        } else {
            message
        }),
    }
}

fn transport(err: &impl std::fmt::Display) -> DriverError {
    DriverError::Provision(format!("Kubernetes request failed: {err}"))
}

/// Authenticated client scoped to one namespace.
#[derive(Clone)]
pub(super) struct KubeClient {
    http: reqwest::Client,
    base: String,
    token: String,
    namespace: String,
}

impl KubeClient {
    pub(super) fn new(config: &KubeConfig, token: String) -> Result<Self, DriverError> {
        let mut builder = reqwest::Client::builder().timeout(HTTP_TIMEOUT);
        if let Some(path) = config.ca_file.as_deref() {
            let pem = crate::fs::read_to_string(path).map_err(|message| {
                DriverError::Configuration(format!("cannot read cluster CA: {message}"))
            })?;
            let certificate = reqwest::Certificate::from_pem(pem.as_bytes()).map_err(|err| {
                DriverError::Configuration(format!("invalid cluster CA {path}: {err}"))
            })?;
            builder = builder.add_root_certificate(certificate);
        }
        if config.insecure_skip_tls_verify {
            warn!(
                api_server = %config.api_server,
                "API server certificate verification is disabled"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|err| DriverError::Configuration(format!("HTTP client setup failed: {err}")))?;
        Ok(Self {
            http,
            base: config.api_server.trim_end_matches('/').to_owned(),
            token,
            namespace: config.namespace.clone(),
        })
    }

    pub(super) fn namespace(&self) -> &str {
        &self.namespace
    }

    fn collection(&self, group_path: &str, plural: &str) -> String {
        format!(
            "{}/{group_path}/namespaces/{}/{plural}",
            self.base, self.namespace
        )
    }

    fn deployments(&self) -> String {
        self.collection("apis/apps/v1", "deployments")
    }

    fn secrets(&self) -> String {
        self.collection("api/v1", "secrets")
    }

    fn pods(&self) -> String {
        self.collection("api/v1", "pods")
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.token)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<(StatusCode, Vec<u8>), DriverError> {
        let response = builder.send().await.map_err(|err| transport(&err))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|err| transport(&err))?;
        Ok((status, body.to_vec()))
    }

    fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, DriverError> {
        serde_json::from_slice(body).map_err(|err| transport(&err))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        kind: &str,
        id: &str,
    ) -> Result<Option<T>, DriverError> {
        let (status, body) = self.send(self.request(Method::GET, url)).await?;
        match status {
            StatusCode::NOT_FOUND => Ok(None),
            ok if ok.is_success() => Self::decode(&body).map(Some),
            other => Err(normalize(other.as_u16(), &body, kind, id)),
        }
    }

    async fn list<T: DeserializeOwned>(
        &self,
        url: &str,
        selector: &str,
        continue_token: Option<&str>,
    ) -> Result<ObjectList<T>, DriverError> {
        let mut query = vec![
            ("labelSelector", selector.to_owned()),
            ("limit", PAGE_SIZE.to_string()),
        ];
        if let Some(token) = continue_token {
            query.push(("continue", token.to_owned()));
        }
        let (status, body) = self
            .send(self.request(Method::GET, url).query(&query))
            .await?;
        if status.is_success() {
            Self::decode(&body)
        } else {
            Err(normalize(status.as_u16(), &body, "namespace", &self.namespace))
        }
    }

    async fn create<T: DeserializeOwned>(
        &self,
        url: &str,
        manifest: &serde_json::Value,
        kind: &str,
        id: &str,
    ) -> Result<Created<T>, DriverError> {
        let (status, body) = self
            .send(self.request(Method::POST, url).json(manifest))
            .await?;
        match status {
            StatusCode::CONFLICT => Ok(Created::AlreadyExists),
            ok if ok.is_success() => Self::decode(&body).map(Created::New),
            other => Err(normalize(other.as_u16(), &body, kind, id)),
        }
    }

    /// Returns `false` when the object was already gone.
    async fn delete(&self, url: &str, kind: &str, id: &str) -> Result<bool, DriverError> {
        let body = serde_json::json!({
            "kind": "DeleteOptions",
            "apiVersion": "v1",
            "propagationPolicy": "Background",
        });
        let (status, response) = self
            .send(self.request(Method::DELETE, url).json(&body))
            .await?;
        match status {
            StatusCode::NOT_FOUND => Ok(false),
            ok if ok.is_success() => Ok(true),
            other => Err(normalize(other.as_u16(), &response, kind, id)),
        }
    }

    pub(super) async fn list_deployments(
        &self,
        selector: &str,
        continue_token: Option<&str>,
    ) -> Result<ObjectList<Deployment>, DriverError> {
        debug!(namespace = %self.namespace, selector, "listing deployments");
        self.list(&self.deployments(), selector, continue_token).await
    }

    pub(super) async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>, DriverError> {
        self.get(&format!("{}/{name}", self.deployments()), "machine", name)
            .await
    }

    pub(super) async fn create_deployment(
        &self,
        name: &str,
        manifest: &serde_json::Value,
    ) -> Result<Created<Deployment>, DriverError> {
        debug!(namespace = %self.namespace, name, "creating deployment");
        self.create(&self.deployments(), manifest, "machine", name)
            .await
    }

    pub(super) async fn delete_deployment(&self, name: &str) -> Result<bool, DriverError> {
        self.delete(&format!("{}/{name}", self.deployments()), "machine", name)
            .await
    }

    /// First page of pods matching `selector`; a deployment has one
    /// replica, so one page always covers it.
    pub(super) async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, DriverError> {
        debug!(namespace = %self.namespace, selector, "listing pods");
        let page: ObjectList<Pod> = self.list(&self.pods(), selector, None).await?;
        Ok(page.items)
    }

    pub(super) async fn list_secrets(
        &self,
        selector: &str,
        continue_token: Option<&str>,
    ) -> Result<ObjectList<Secret>, DriverError> {
        self.list(&self.secrets(), selector, continue_token).await
    }

    pub(super) async fn get_secret(&self, name: &str) -> Result<Option<Secret>, DriverError> {
        self.get(&format!("{}/{name}", self.secrets()), "key-pair", name)
            .await
    }

    pub(super) async fn create_secret(
        &self,
        name: &str,
        manifest: &serde_json::Value,
    ) -> Result<Created<Secret>, DriverError> {
        self.create(&self.secrets(), manifest, "key-pair", name)
            .await
    }

    pub(super) async fn delete_secret(&self, name: &str) -> Result<bool, DriverError> {
        self.delete(&format!("{}/{name}", self.secrets()), "key-pair", name)
            .await
    }
}
