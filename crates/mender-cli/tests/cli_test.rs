use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn mender() -> Command {
    let mut cmd = Command::cargo_bin("mender").unwrap();
    for var in [
        "MENDER_CONFIG",
        "PROXY_HOST",
        "PROXY_PORT",
        "LITELLM_URL",
        "PROXY_DEBUG",
        "PROXY_LOG_FILE",
        "PROXY_CONNECT_TIMEOUT_SECS",
        "PROXY_REQUEST_TIMEOUT_SECS",
        "PROXY_STREAM_IDLE_TIMEOUT_SECS",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn config_prints_layered_yaml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mender.yml");
    fs::write(
        &path,
        "port: 9000\nbackend_url: http://file:4000\npolicy:\n  blocked_params: [tool_choice]\n",
    )
    .unwrap();

    mender()
        .env("LITELLM_URL", "http://env:4000")
        .args(["--config", path.to_str().unwrap(), "--port", "9100", "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("port: 9100"))
        .stdout(predicate::str::contains("http://env:4000"))
        .stdout(predicate::str::contains("- tool_choice"))
        .stdout(predicate::str::contains("- thinking").not());
}

#[test]
fn invalid_backend_url_is_rejected() {
    mender()
        .args(["--backend-url", "relay:4000", "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("backend_url"));
}

#[test]
fn backend_flag_overrides_bad_environment_url() {
    mender()
        .env("LITELLM_URL", "relay:4000")
        .args(["--backend-url", "http://good:4000", "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("http://good:4000"));
}

#[test]
fn missing_config_file_is_reported() {
    mender()
        .args(["--config", "/nonexistent/mender.yml", "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load configuration"));
}

#[test]
fn check_fails_when_nothing_is_listening() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    mender()
        .args([
            "--port",
            &port.to_string(),
            "--backend-url",
            &format!("http://127.0.0.1:{}", port),
            "check",
        ])
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAILED"));
}
