//! Behavioural smoke tests for the `prevue` CLI against the fake driver.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::{contains, is_empty};
use tempfile::TempDir;

fn workdir() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"))
}

fn prevue(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("prevue");
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env("PREVUE_DRIVER", "fake")
        .env_remove("PREVUE_CONFIG_PATH")
        .env_remove("PREVUE_TUNNEL_RELAY_URL")
        .env_remove("PREVUE_LOG");
    cmd
}

#[test]
fn ls_prints_an_empty_json_array_for_an_empty_account() {
    let dir = workdir();
    prevue(&dir)
        .args(["--output", "json", "ls"])
        .assert()
        .success()
        .stdout(contains("[]"));
}

#[test]
fn purge_without_kinds_affects_nothing() {
    let dir = workdir();
    prevue(&dir)
        .arg("purge")
        .assert()
        .success()
        .stdout(contains("0 resource(s) affected"));
}

#[test]
fn down_reports_missing_environments() {
    let dir = workdir();
    prevue(&dir)
        .args(["down", "--id", "ghost"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("prevue: environment ghost not found"));
}

#[test]
fn forced_down_tolerates_missing_environments() {
    let dir = workdir();
    prevue(&dir)
        .args(["down", "--id", "ghost", "--force"])
        .assert()
        .success()
        .stdout(contains("0 resource(s) affected"));
}

#[test]
fn up_with_an_explicit_id_provisions_a_machine() {
    let dir = workdir();
    prevue(&dir)
        .args(["up", "--id", "Demo App"])
        .assert()
        .success()
        .stdout(contains("environment demo-app is up on machine"));
}

#[test]
fn up_derives_the_environment_from_the_compose_project() {
    let dir = workdir();
    std::fs::write(
        dir.path().join("compose.yaml"),
        "name: shop\nservices:\n  web:\n    ports:\n      - \"8080:80\"\n",
    )
    .unwrap_or_else(|err| panic!("write compose file: {err}"));

    prevue(&dir)
        .arg("up")
        .assert()
        .success()
        .stdout(contains("environment shop is up on machine"));
}

#[test]
fn up_without_an_id_or_project_asks_for_one() {
    let dir = workdir();
    prevue(&dir)
        .arg("up")
        .assert()
        .failure()
        .code(1)
        .stdout(is_empty())
        .stderr(contains("pass --id"));
}

#[test]
fn unknown_drivers_are_rejected_before_any_work() {
    let dir = workdir();
    prevue(&dir)
        .env("PREVUE_DRIVER", "openstack")
        .arg("ls")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("unknown driver 'openstack'"));
}

#[test]
fn malformed_port_flags_are_rejected() {
    let dir = workdir();
    prevue(&dir)
        .args(["up", "--id", "demo", "--port", "web"])
        .assert()
        .failure()
        .stderr(contains("expected SERVICE:PORT"));
}

#[test]
fn detached_up_is_refused_while_a_relay_would_expose_ports() {
    let dir = workdir();
    prevue(&dir)
        .env("PREVUE_TUNNEL_RELAY_URL", "ssh://127.0.0.1:9")
        .args(["up", "--id", "demo", "--port", "web:8080", "--detach"])
        .assert()
        .failure()
        .code(1)
        .stdout(is_empty())
        .stderr(contains("--detach cannot be combined with a relay"));
}

#[test]
fn detached_up_without_a_relay_still_provisions() {
    let dir = workdir();
    prevue(&dir)
        .args(["up", "--id", "demo", "--port", "web:8080", "--detach"])
        .assert()
        .success()
        .stdout(contains("environment demo is up on machine"));
}

#[test]
fn down_clears_session_entries_left_by_dead_processes() {
    let dir = workdir();
    let sessions = dir.path().join(".prevue").join("sessions");
    std::fs::create_dir_all(&sessions).unwrap_or_else(|err| panic!("session dir: {err}"));
    let dead_port = std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or_else(|err| panic!("reserve port: {err}"));
    let entry = sessions.join("ghost.port");
    std::fs::write(&entry, dead_port.to_string()).unwrap_or_else(|err| panic!("entry: {err}"));

    prevue(&dir)
        .args(["down", "--id", "ghost", "--force"])
        .assert()
        .success()
        .stdout(contains("0 resource(s) affected"));
    assert!(!entry.exists());
}
