//! Unit tests for the Scaleway backend that need no network access.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use rstest::{fixture, rstest};
use scaleway_rs::ScalewayImage;

use super::api::ServerRecord;
use super::image::ImageQuery;
use super::*;
use crate::error::ErrorKind;

#[derive(Copy, Clone)]
struct ImageSpec {
    id: &'static str,
    arch: &'static str,
    state: &'static str,
    creation_date: &'static str,
}

fn image(spec: ImageSpec) -> ScalewayImage {
    ScalewayImage {
        id: spec.id.to_owned(),
        name: String::new(),
        arch: spec.arch.to_owned(),
        creation_date: spec.creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: spec.state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

fn config() -> ScalewayConfig {
    ScalewayConfig {
        access_key: None,
        secret_key: String::from("dummy"),
        default_organization_id: None,
        default_project_id: String::from("proj"),
        default_zone: String::from("fr-par-1"),
        default_instance_type: String::from("DEV1-S"),
        default_image: String::from("Ubuntu 24.04 Noble Numbat"),
        default_architecture: String::from("x86_64"),
        ssh_public_key_file: Some(String::from("~/.ssh/prevue.pub")),
    }
}

#[fixture]
fn backend() -> ScalewayBackend {
    let mut backend = ScalewayBackend::new(config(), "default").expect("valid config");
    backend.poll_interval = Duration::from_millis(1);
    backend.wait_timeout = Duration::from_millis(50);
    backend.delete_timeout = Duration::from_millis(5);
    backend
}

fn query() -> ImageQuery<'static> {
    ImageQuery {
        label: "Ubuntu 24.04 Noble Numbat",
        arch: "x86_64",
        zone: "fr-par-1",
        project_id: "proj",
        organisation_id: None,
    }
}

fn server(state: &str, tags: &[&str], ip: Option<&str>) -> ServerRecord {
    let mut value = serde_json::json!({
        "id": "srv-1",
        "name": "prevue-demo",
        "state": state,
        "tags": tags,
        "commercial_type": "DEV1-S",
        "creation_date": "2026-03-01T10:00:00Z",
    });
    if let Some(address) = ip {
        value["public_ips"] = serde_json::json!([{ "address": address }]);
    }
    serde_json::from_value(value).expect("server record")
}

#[rstest]
fn tagged_servers_map_to_machines(backend: ScalewayBackend) {
    let machine = backend
        .machine_from_server(server(
            "running",
            &["prevue", "prevue-env-demo", "prevue-key-key-7"],
            Some("51.15.0.10"),
        ))
        .expect("managed server");
    assert_eq!(machine.environment_id.as_ref().map(EnvironmentId::as_str), Some("demo"));
    assert_eq!(machine.key_pair_id.as_deref(), Some("key-7"));
    assert_eq!(machine.address, Some(Address::new("51.15.0.10", 22)));
    assert_eq!(machine.region, "fr-par-1");
}

#[rstest]
fn prefixed_servers_without_env_tag_are_untagged(backend: ScalewayBackend) {
    let machine = backend
        .machine_from_server(server("stopped", &[], None))
        .expect("named like a managed server");
    assert!(machine.is_untagged());
}

#[rstest]
fn foreign_servers_are_ignored(backend: ScalewayBackend) {
    let mut foreign = server("running", &["web"], None);
    foreign.name = String::from("production-db");
    assert!(backend.machine_from_server(foreign).is_none());
}

#[rstest]
fn server_tags_carry_environment_and_key_pair() {
    let id = EnvironmentId::normalize("proj-abc123").expect("id");
    let key = KeyPair {
        id: String::from("key-1"),
        name: String::from("prevue-default"),
        fingerprint: None,
        created_at: None,
    };
    assert_eq!(
        ScalewayBackend::server_tags(&id, Some(&key)),
        vec!["prevue", "prevue-env-proj-abc123", "prevue-key-key-1"]
    );
}

#[rstest]
fn connection_params_use_ssh_and_derive_identity(backend: ScalewayBackend) {
    let mut machine = backend
        .machine_from_server(server("running", &["prevue", "prevue-env-demo"], Some("10.0.0.2")))
        .expect("machine");
    let params = backend.connection_params(&machine).expect("params");
    assert_eq!(
        params.auth,
        AuthMethod::Ssh {
            user: String::from("root"),
            identity_file: Some(String::from("~/.ssh/prevue")),
        }
    );
    assert!(params.interactive);

    machine.address = None;
    let err = backend.connection_params(&machine).expect_err("no address");
    assert_eq!(err.kind(), ErrorKind::Unreachable);
}

#[rstest]
#[tokio::test]
async fn image_resolution_prefers_project_results(backend: ScalewayBackend) {
    let public_called = Rc::new(Cell::new(false));
    let flag = Rc::clone(&public_called);
    let resolved = backend
        .resolve_image_id_with(
            &query(),
            || async {
                Ok(vec![
                    image(ImageSpec {
                        id: "older",
                        arch: "x86_64",
                        state: "available",
                        creation_date: "2025-01-01T00:00:00Z",
                    }),
                    image(ImageSpec {
                        id: "newest",
                        arch: "x86_64",
                        state: "available",
                        creation_date: "2025-02-01T00:00:00Z",
                    }),
                ])
            },
            move || {
                flag.set(true);
                async { Ok(Vec::new()) }
            },
        )
        .await
        .expect("project image");
    assert_eq!(resolved, "newest");
    assert!(!public_called.get(), "public lookup should not be needed");
}

#[rstest]
#[tokio::test]
async fn image_resolution_skips_wrong_arch_and_falls_back(backend: ScalewayBackend) {
    let resolved = backend
        .resolve_image_id_with(
            &query(),
            || async {
                Ok(vec![image(ImageSpec {
                    id: "arm-only",
                    arch: "arm64",
                    state: "available",
                    creation_date: "2025-03-01T00:00:00Z",
                })])
            },
            || async {
                Ok(vec![image(ImageSpec {
                    id: "public-img",
                    arch: "x86_64",
                    state: "available",
                    creation_date: "2025-01-01T00:00:00Z",
                })])
            },
        )
        .await
        .expect("public fallback");
    assert_eq!(resolved, "public-img");
}

#[rstest]
#[tokio::test]
async fn missing_images_are_configuration_errors(backend: ScalewayBackend) {
    let err = backend
        .resolve_image_id_with(&query(), || async { Ok(Vec::new()) }, || async {
            Ok(Vec::new())
        })
        .await
        .expect_err("nothing to pick");
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[rstest]
#[tokio::test]
async fn wait_for_address_reports_running_machines_without_ip(backend: ScalewayBackend) {
    let err = backend
        .wait_for_address_with("srv-1", || async {
            Ok(Some(server("running", &["prevue"], None)))
        })
        .await
        .expect_err("no address");
    assert_eq!(err.kind(), ErrorKind::Unreachable);
}

#[rstest]
#[tokio::test]
async fn wait_for_address_returns_once_running(backend: ScalewayBackend) {
    let states = std::cell::RefCell::new(VecDeque::from(vec![
        None,
        Some(server("starting", &["prevue"], None)),
        Some(server("running", &["prevue"], Some("10.1.1.1"))),
    ]));
    let (_, address) = backend
        .wait_for_address_with("srv-1", || {
            let next = states.borrow_mut().pop_front().flatten();
            async move { Ok(next) }
        })
        .await
        .expect("address");
    assert_eq!(address, Address::new("10.1.1.1", 22));
}

#[rstest]
#[tokio::test]
async fn wait_for_ssh_ready_succeeds_when_port_listens(mut backend: ScalewayBackend) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind listener: {err}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("listener addr: {err}"));
    tokio::spawn(async move { if let Ok((_stream, _addr)) = listener.accept().await {} });

    backend.wait_timeout = Duration::from_millis(200);
    backend
        .wait_for_ssh_ready("srv-1", &Address::new("127.0.0.1", addr.port()))
        .await
        .unwrap_or_else(|err| panic!("ssh should be reachable: {err}"));
}

#[rstest]
#[tokio::test]
async fn wait_for_ssh_ready_times_out_when_port_closed(backend: ScalewayBackend) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind listener: {err}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("listener addr: {err}"));
    drop(listener);

    let err = backend
        .wait_for_ssh_ready("srv-1", &Address::new("127.0.0.1", addr.port()))
        .await
        .expect_err("expected timeout");
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[rstest]
#[tokio::test]
async fn wait_until_gone_times_out_on_residual(backend: ScalewayBackend) {
    let err = backend
        .wait_until_gone("machine", "srv-1", || async { Ok(true) })
        .await
        .expect_err("still present");
    assert!(matches!(err, DriverError::Timeout { ref action, .. } if action == "machine removal"));
}

#[rstest]
#[tokio::test]
async fn snapshot_wait_fails_on_error_state(backend: ScalewayBackend) {
    let err = backend
        .wait_for_snapshot("snap-1", || async { Ok(Some(String::from("error"))) })
        .await
        .expect_err("error state");
    assert_eq!(err.kind(), ErrorKind::Provision);
}
