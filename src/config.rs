//! Configuration loading via `ortho-config`.
//!
//! Each concern owns one struct. Values merge defaults, `prevue.toml`
//! discovery and environment variables; the CLI layers its own flags on top.
//! Adapter specific structs are only loaded once the matching driver is
//! selected, so a fake run never needs cloud credentials.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::BackendKind;
use crate::error::DriverError;

/// Name used as `argv[0]` when loading without CLI arguments.
const APP_NAME: &str = "prevue";

/// Top-level settings shared by every command.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PREVUE",
    discovery(
        app_name = "prevue",
        env_var = "PREVUE_CONFIG_PATH",
        config_file_name = "prevue.toml",
        dotfile_name = ".prevue.toml",
        project_file_name = "prevue.toml"
    )
)]
pub struct PrevueConfig {
    /// Backend identifier: `scaleway`, `kube` or `fake`.
    #[ortho_config(default = "scaleway".to_owned())]
    pub driver: String,
    /// Profile name; scopes the key pair (`prevue-<profile>`).
    #[ortho_config(default = "default".to_owned())]
    pub profile: String,
    /// Concurrent deletions per purge phase.
    #[ortho_config(default = 4)]
    pub purge_concurrency: u32,
    /// Overall provisioning deadline in seconds, retries included.
    #[ortho_config(default = 900)]
    pub provision_timeout_secs: u64,
    /// Attempts made for retryable failures.
    #[ortho_config(default = 3)]
    pub retry_attempts: u32,
    /// Delay before the second attempt; doubles afterwards.
    #[ortho_config(default = 500)]
    pub retry_base_delay_ms: u64,
    /// Whether usage events are sent.
    #[ortho_config(default = false)]
    pub telemetry_enabled: bool,
    /// Collector endpoint for usage events.
    pub telemetry_endpoint: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to prevue.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "invalid {} ({reason}): check {} or {} in prevue.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

fn require_optional_field(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    match value {
        Some(inner) if inner.trim().is_empty() => Err(metadata.invalid("empty value")),
        _ => Ok(()),
    }
}

fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(metadata.invalid("must be greater than zero"));
    }
    Ok(())
}

impl PrevueConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Parses the configured driver identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown identifiers.
    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        self.driver
            .parse::<BackendKind>()
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    /// Validates values the loader cannot check on its own.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend_kind()?;
        require_field(
            &self.profile,
            &FieldMetadata::new("profile name", "PREVUE_PROFILE", "profile"),
        )?;
        require_positive(
            u64::from(self.purge_concurrency),
            &FieldMetadata::new(
                "purge concurrency",
                "PREVUE_PURGE_CONCURRENCY",
                "purge_concurrency",
            ),
        )?;
        require_positive(
            u64::from(self.retry_attempts),
            &FieldMetadata::new("retry attempts", "PREVUE_RETRY_ATTEMPTS", "retry_attempts"),
        )?;
        require_positive(
            self.provision_timeout_secs,
            &FieldMetadata::new(
                "provisioning timeout",
                "PREVUE_PROVISION_TIMEOUT_SECS",
                "provision_timeout_secs",
            ),
        )?;
        if self.telemetry_enabled {
            require_field(
                self.telemetry_endpoint.as_deref().unwrap_or_default(),
                &FieldMetadata::new(
                    "telemetry endpoint",
                    "PREVUE_TELEMETRY_ENDPOINT",
                    "telemetry_endpoint",
                ),
            )?;
        }
        Ok(())
    }

    /// Overall provisioning deadline.
    #[must_use]
    pub const fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    /// Delay before the first retry.
    #[must_use]
    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Scaleway specific configuration derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: String,
    /// Availability zone. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type for new machines.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Human-friendly image label (for example `Ubuntu 24.04 Noble Numbat`).
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
    /// Public key registered as the profile key pair on first provision.
    pub ssh_public_key_file: Option<String>,
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails, including when
    /// the secret key or project id are absent from every source.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                self.secret_key.as_str(),
                FieldMetadata::new("Scaleway API secret key", "SCW_SECRET_KEY", "secret_key"),
            ),
            (
                self.default_project_id.as_str(),
                FieldMetadata::new(
                    "Scaleway project ID",
                    "SCW_DEFAULT_PROJECT_ID",
                    "default_project_id",
                ),
            ),
            (
                self.default_image.as_str(),
                FieldMetadata::new("VM image", "SCW_DEFAULT_IMAGE", "default_image"),
            ),
            (
                self.default_instance_type.as_str(),
                FieldMetadata::new(
                    "instance type",
                    "SCW_DEFAULT_INSTANCE_TYPE",
                    "default_instance_type",
                ),
            ),
            (
                self.default_zone.as_str(),
                FieldMetadata::new("availability zone", "SCW_DEFAULT_ZONE", "default_zone"),
            ),
            (
                self.default_architecture.as_str(),
                FieldMetadata::new(
                    "CPU architecture",
                    "SCW_DEFAULT_ARCHITECTURE",
                    "default_architecture",
                ),
            ),
        ];
        for (value, metadata) in &required {
            require_field(value, metadata)?;
        }
        require_optional_field(
            self.ssh_public_key_file.as_deref(),
            &FieldMetadata::new(
                "SSH public key file",
                "SCW_SSH_PUBLIC_KEY_FILE",
                "ssh_public_key_file",
            ),
        )
    }
}

/// Kubernetes backend settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PREVUE_KUBE",
    discovery(
        app_name = "prevue",
        env_var = "PREVUE_CONFIG_PATH",
        config_file_name = "prevue.toml",
        dotfile_name = ".prevue.toml",
        project_file_name = "prevue.toml"
    )
)]
pub struct KubeConfig {
    /// API server base URL.
    #[ortho_config(default = "https://kubernetes.default.svc".to_owned())]
    pub api_server: String,
    /// Bearer token. Falls back to the in-cluster service account token.
    pub token: Option<String>,
    /// Namespace holding preview deployments.
    #[ortho_config(default = "default".to_owned())]
    pub namespace: String,
    /// Workload image.
    #[ortho_config(default = "ubuntu:24.04".to_owned())]
    pub image: String,
    /// PEM bundle used to verify the API server.
    pub ca_file: Option<String>,
    /// Disables API server certificate verification.
    #[ortho_config(default = false)]
    pub insecure_skip_tls_verify: bool,
    /// Kubeconfig context passed to `kubectl exec`.
    pub context: Option<String>,
}

impl KubeConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.api_server,
            &FieldMetadata::new("API server URL", "PREVUE_KUBE_API_SERVER", "api_server"),
        )?;
        if reqwest::Url::parse(&self.api_server).is_err() {
            return Err(
                FieldMetadata::new("API server URL", "PREVUE_KUBE_API_SERVER", "api_server")
                    .invalid("not an absolute URL"),
            );
        }
        require_field(
            &self.namespace,
            &FieldMetadata::new("namespace", "PREVUE_KUBE_NAMESPACE", "namespace"),
        )?;
        require_field(
            &self.image,
            &FieldMetadata::new("workload image", "PREVUE_KUBE_IMAGE", "image"),
        )?;
        require_optional_field(
            self.token.as_deref(),
            &FieldMetadata::new("bearer token", "PREVUE_KUBE_TOKEN", "token"),
        )?;
        require_optional_field(
            self.ca_file.as_deref(),
            &FieldMetadata::new("CA bundle", "PREVUE_KUBE_CA_FILE", "ca_file"),
        )
    }
}

/// Execution transport settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PREVUE_EXEC",
    discovery(
        app_name = "prevue",
        env_var = "PREVUE_CONFIG_PATH",
        config_file_name = "prevue.toml",
        dotfile_name = ".prevue.toml",
        project_file_name = "prevue.toml"
    )
)]
pub struct ExecConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `kubectl` executable.
    #[ortho_config(default = "kubectl".to_owned())]
    pub kubectl_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Private key for SSH authentication. Supports tilde expansion.
    pub ssh_identity_file: Option<String>,
    /// TCP pre-flight dial deadline in seconds.
    #[ortho_config(default = 10)]
    pub dial_timeout_secs: u64,
    /// Upper bound on captured batch output, stdout and stderr combined.
    #[ortho_config(default = 16_777_216)]
    pub output_limit_bytes: u64,
    /// Time a cancelled interactive process gets before it is killed.
    #[ortho_config(default = 5)]
    pub cancel_grace_secs: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            kubectl_bin: String::from("kubectl"),
            ssh_user: String::from("root"),
            ssh_identity_file: None,
            dial_timeout_secs: 10,
            output_limit_bytes: 16_777_216,
            cancel_grace_secs: 5,
        }
    }
}

impl ExecConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.ssh_bin,
            &FieldMetadata::new("ssh executable", "PREVUE_EXEC_SSH_BIN", "ssh_bin"),
        )?;
        require_field(
            &self.kubectl_bin,
            &FieldMetadata::new("kubectl executable", "PREVUE_EXEC_KUBECTL_BIN", "kubectl_bin"),
        )?;
        require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH user", "PREVUE_EXEC_SSH_USER", "ssh_user"),
        )?;
        require_optional_field(
            self.ssh_identity_file.as_deref(),
            &FieldMetadata::new(
                "SSH identity file",
                "PREVUE_EXEC_SSH_IDENTITY_FILE",
                "ssh_identity_file",
            ),
        )?;
        require_positive(
            self.dial_timeout_secs,
            &FieldMetadata::new("dial timeout", "PREVUE_EXEC_DIAL_TIMEOUT_SECS", "dial_timeout_secs"),
        )?;
        require_positive(
            self.output_limit_bytes,
            &FieldMetadata::new(
                "output limit",
                "PREVUE_EXEC_OUTPUT_LIMIT_BYTES",
                "output_limit_bytes",
            ),
        )
    }

    /// TCP pre-flight dial deadline.
    #[must_use]
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Grace period granted after cancellation.
    #[must_use]
    pub const fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    /// Output bound as a `usize`, saturating on narrow targets.
    #[must_use]
    pub fn output_limit(&self) -> usize {
        usize::try_from(self.output_limit_bytes).unwrap_or(usize::MAX)
    }
}

/// Relay tunnel settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PREVUE_TUNNEL",
    discovery(
        app_name = "prevue",
        env_var = "PREVUE_CONFIG_PATH",
        config_file_name = "prevue.toml",
        dotfile_name = ".prevue.toml",
        project_file_name = "prevue.toml"
    )
)]
pub struct TunnelConfig {
    /// Relay address, `ssh+tls://host[:port]` or `ssh://host[:port]`.
    pub relay_url: Option<String>,
    /// Skips relay certificate verification. Logged loudly.
    #[ortho_config(default = false)]
    pub insecure_skip_verify: bool,
    /// PEM file with the CA the relay certificate must chain to.
    pub ca_file: Option<String>,
    /// Ed25519 seed file identifying this client; created when missing.
    #[ortho_config(default = ".prevue/tunnel.key".to_owned())]
    pub identity_file: String,
    /// Deadline for dialing and completing the relay handshake.
    #[ortho_config(default = 15)]
    pub handshake_timeout_secs: u64,
    /// Reconnection attempts before the session is declared lost.
    #[ortho_config(default = 5)]
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnection attempt; doubles afterwards.
    #[ortho_config(default = 500)]
    pub reconnect_base_delay_ms: u64,
    /// Host forwarded connections are dialed on; defaults to the machine
    /// address.
    pub target_host: Option<String>,
    /// Directory where a running `up` registers its session so `down` can
    /// close it from another process.
    #[ortho_config(default = ".prevue/sessions".to_owned())]
    pub session_dir: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            insecure_skip_verify: false,
            ca_file: None,
            identity_file: String::from(".prevue/tunnel.key"),
            handshake_timeout_secs: 15,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 500,
            target_host: None,
            session_dir: String::from(".prevue/sessions"),
        }
    }
}

impl TunnelConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Validates the relay settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_optional_field(
            self.relay_url.as_deref(),
            &FieldMetadata::new("relay URL", "PREVUE_TUNNEL_RELAY_URL", "relay_url"),
        )?;
        require_optional_field(
            self.ca_file.as_deref(),
            &FieldMetadata::new("relay CA file", "PREVUE_TUNNEL_CA_FILE", "ca_file"),
        )?;
        require_field(
            &self.identity_file,
            &FieldMetadata::new(
                "tunnel identity file",
                "PREVUE_TUNNEL_IDENTITY_FILE",
                "identity_file",
            ),
        )?;
        require_field(
            &self.session_dir,
            &FieldMetadata::new(
                "tunnel session directory",
                "PREVUE_TUNNEL_SESSION_DIR",
                "session_dir",
            ),
        )?;
        require_positive(
            self.handshake_timeout_secs,
            &FieldMetadata::new(
                "handshake timeout",
                "PREVUE_TUNNEL_HANDSHAKE_TIMEOUT_SECS",
                "handshake_timeout_secs",
            ),
        )
    }

    /// Deadline for dialing and handshaking.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Delay before the first reconnection attempt.
    #[must_use]
    pub const fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<ConfigError> for DriverError {
    fn from(value: ConfigError) -> Self {
        Self::Configuration(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn prevue() -> PrevueConfig {
        PrevueConfig {
            driver: String::from("fake"),
            profile: String::from("default"),
            purge_concurrency: 4,
            provision_timeout_secs: 900,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            telemetry_enabled: false,
            telemetry_endpoint: None,
        }
    }

    #[fixture]
    fn scaleway() -> ScalewayConfig {
        ScalewayConfig {
            access_key: None,
            secret_key: String::from("secret"),
            default_organization_id: None,
            default_project_id: String::from("project"),
            default_zone: String::from("fr-par-1"),
            default_instance_type: String::from("DEV1-S"),
            default_image: String::from("Ubuntu 24.04 Noble Numbat"),
            default_architecture: String::from("x86_64"),
            ssh_public_key_file: None,
        }
    }

    #[rstest]
    fn unknown_driver_is_rejected(mut prevue: PrevueConfig) {
        prevue.driver = String::from("openstack");
        let err = prevue.validate().expect_err("unknown driver");
        assert!(matches!(err, ConfigError::Invalid(ref message) if message.contains("openstack")));
    }

    #[rstest]
    fn zero_concurrency_names_the_env_var(mut prevue: PrevueConfig) {
        prevue.purge_concurrency = 0;
        let err = prevue.validate().expect_err("zero concurrency");
        assert!(err.to_string().contains("PREVUE_PURGE_CONCURRENCY"), "{err}");
    }

    #[rstest]
    fn telemetry_requires_an_endpoint(mut prevue: PrevueConfig) {
        prevue.telemetry_enabled = true;
        let err = prevue.validate().expect_err("endpoint missing");
        assert!(err.to_string().contains("PREVUE_TELEMETRY_ENDPOINT"), "{err}");
    }

    #[rstest]
    fn missing_secret_key_is_actionable(mut scaleway: ScalewayConfig) {
        scaleway.secret_key = String::from("   ");
        let err = scaleway.validate().expect_err("secret missing");
        let message = err.to_string();
        assert!(message.contains("SCW_SECRET_KEY"), "{message}");
        assert!(message.contains("secret_key"), "{message}");
    }

    #[rstest]
    fn blank_identity_file_is_rejected() {
        let config = ExecConfig {
            ssh_identity_file: Some(String::from(" ")),
            ..ExecConfig::default()
        };
        let err = config.validate().expect_err("blank identity");
        assert!(err.to_string().contains("PREVUE_EXEC_SSH_IDENTITY_FILE"));
    }

    #[test]
    fn kube_api_server_must_be_a_url() {
        let config = KubeConfig {
            api_server: String::from("not a url"),
            token: Some(String::from("t")),
            namespace: String::from("default"),
            image: String::from("ubuntu:24.04"),
            ca_file: None,
            insecure_skip_tls_verify: false,
            context: None,
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn config_errors_become_configuration_failures() {
        let err = DriverError::from(ConfigError::MissingField(String::from("x")));
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
