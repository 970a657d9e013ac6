//! Tests for layered configuration loading and validation.

use camino::Utf8PathBuf;
use prevue::backend::BackendKind;
use prevue::config::{ConfigError, PrevueConfig, TunnelConfig};
use prevue::test_support::EnvGuard;
use prevue::tunnel::TunnelClient;
use rstest::rstest;
use tempfile::TempDir;

fn temp_home() -> (TempDir, String) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let home = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp home should be utf8: {}", path.display()));
    (tmp, home.into_string())
}

#[tokio::test]
async fn environment_variables_override_defaults() {
    let (_tmp, home) = temp_home();
    let _guard = EnvGuard::set_vars(&[
        ("HOME", home.as_str()),
        ("PREVUE_DRIVER", "fake"),
        ("PREVUE_PURGE_CONCURRENCY", "2"),
    ])
    .await;

    let config = PrevueConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    assert_eq!(config.backend_kind(), Ok(BackendKind::Fake));
    assert_eq!(config.purge_concurrency, 2);
    assert_eq!(config.profile, "default");
    assert!(!config.telemetry_enabled);
}

#[test]
fn unknown_drivers_list_the_known_ones() {
    let config = PrevueConfig {
        driver: String::from("openstack"),
        ..default_config()
    };

    let err = config.validate().expect_err("unknown driver");
    let ConfigError::Invalid(message) = err else {
        panic!("expected Invalid error, got {err:?}");
    };
    assert!(
        message.contains("scaleway, kube, fake"),
        "error should list known drivers: {message}"
    );
}

#[rstest]
#[case::zero_concurrency(PrevueConfig { purge_concurrency: 0, ..default_config() }, "PREVUE_PURGE_CONCURRENCY")]
#[case::zero_attempts(PrevueConfig { retry_attempts: 0, ..default_config() }, "PREVUE_RETRY_ATTEMPTS")]
#[case::telemetry_without_endpoint(
    PrevueConfig { telemetry_enabled: true, telemetry_endpoint: None, ..default_config() },
    "PREVUE_TELEMETRY_ENDPOINT"
)]
fn validation_errors_name_the_setting(#[case] config: PrevueConfig, #[case] env_var: &str) {
    let err = config.validate().expect_err("config should be rejected");
    let message = err.to_string();
    assert!(
        message.contains(env_var),
        "error should mention {env_var}: {message}"
    );
    assert!(
        message.contains("prevue.toml"),
        "error should mention the config file: {message}"
    );
}

#[tokio::test]
async fn tunnel_identity_is_created_under_the_home_directory() {
    let (tmp, home) = temp_home();
    let _guard = EnvGuard::set_vars(&[("HOME", home.as_str())]).await;

    let config = TunnelConfig {
        relay_url: Some(String::from("ssh://127.0.0.1:2222")),
        identity_file: String::from("~/.prevue/tunnel.key"),
        ..TunnelConfig::default()
    };

    TunnelClient::new(&config).unwrap_or_else(|err| panic!("tunnel client: {err}"));

    assert!(tmp.path().join(".prevue").join("tunnel.key").is_file());
}

#[tokio::test]
async fn relay_url_is_read_from_the_environment() {
    let (_tmp, home) = temp_home();
    let _guard = EnvGuard::set_vars(&[
        ("HOME", home.as_str()),
        ("PREVUE_TUNNEL_RELAY_URL", "ssh+tls://relay.example.com:443"),
    ])
    .await;

    let config = TunnelConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("tunnel config should load: {err}"));

    assert_eq!(
        config.relay_url.as_deref(),
        Some("ssh+tls://relay.example.com:443")
    );
    assert!(config.validate().is_ok());
}

fn default_config() -> PrevueConfig {
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
