#![allow(clippy::unwrap_used, clippy::expect_used)]

//! CLI smoke tests for the provisioner-server binary
//!
//! These drive the built binary: help output, configuration validation,
//! spool commands and signal-driven shutdown of `run`.

use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use tempfile::TempDir;

fn run_provisioner(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_provisioner-server"))
        .args(args)
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("Failed to execute provisioner-server")
}

fn write_config(dir: &Path, body: &str) -> String {
    let path = dir.join("provisioner.yaml");
    std::fs::write(&path, body).expect("Failed to write config file");
    path.to_string_lossy().into_owned()
}

fn spool_config(dir: &Path) -> String {
    let spool = dir.join("spool").to_string_lossy().replace('\\', "/");
    write_config(
        dir,
        &format!("logging:\n  level: error\nprovisioning:\n  queue:\n    spool_dir: \"{spool}\"\n"),
    )
}

#[test]
fn test_cli_help_command() {
    let output = run_provisioner(&["--help"]);
    assert!(output.status.success(), "Help command should succeed");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"), "Should contain usage information");
    for subcommand in ["run", "check", "enqueue", "admin", "dead-letters"] {
        assert!(stdout.contains(subcommand), "Should list '{subcommand}'");
    }
    assert!(stdout.contains("--config"), "Should mention config option");
    assert!(stdout.contains("--mock"), "Should mention mock option");
}

#[test]
fn test_cli_version_command() {
    let output = run_provisioner(&["--version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("provisioner-server"));
}

#[test]
fn test_cli_invalid_command() {
    let output = run_provisioner(&["invalid-command"]);
    assert!(!output.status.success(), "Invalid command should fail");
}

#[test]
fn test_cli_config_validation_missing_file() {
    let output = run_provisioner(&["--config", "/nonexistent/config.yaml", "check"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "{stderr}");
}

#[test]
fn test_cli_config_validation_invalid_yaml() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(temp_dir.path(), "invalid: yaml: content: [unclosed");

    let output = run_provisioner(&["--config", &config_path, "check"]);
    assert!(!output.status.success(), "Should fail with invalid YAML");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("configuration"), "{stderr}");
}

#[test]
fn test_cli_rejects_unknown_fields() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(temp_dir.path(), "provisioning:\n  ports:\n    stop: 9100\n");

    let output = run_provisioner(&["--config", &config_path, "check"]);
    assert!(!output.status.success(), "Unknown keys should be rejected");
}

#[test]
fn test_cli_rejects_inverted_port_range() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        temp_dir.path(),
        "provisioning:\n  ports:\n    start: 9100\n    end: 9001\n",
    );

    let output = run_provisioner(&["--config", &config_path, "check"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ports.start"), "{stderr}");
}

#[test]
fn test_cli_check_valid_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        temp_dir.path(),
        r#"
logging:
  level: warn
  format: json
provisioning:
  ports:
    start: 9001
    end: 9050
  retry:
    max_retries: 3
    base_backoff: 1s
    max_backoff: 1m
  call_timeout: 45s
  routes:
    domain: "example.com"
"#,
    );

    let output = run_provisioner(&["--config", &config_path, "check"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "STDOUT: {stdout}\nSTDERR: {stderr}");
    assert!(stdout.contains("Configuration is valid"));
    assert!(stdout.contains("example.com"));
    assert!(stdout.contains("45s"));
}

#[test]
fn test_cli_print_config_uses_env_overrides() {
    let output = Command::new(env!("CARGO_BIN_EXE_provisioner-server"))
        .arg("--print-config")
        .env("PROVISIONER__PROVISIONING__PORTS__END", "9200")
        .env_remove("RUST_LOG")
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Effective configuration"));
    assert!(stdout.contains("9200"), "{stdout}");
}

#[test]
fn test_cli_enqueue_and_dead_letters_on_empty_spool() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = spool_config(temp_dir.path());

    let output = run_provisioner(&[
        "--config",
        &config_path,
        "enqueue",
        "provision",
        "--user-id",
        "u-1",
        "--username",
        "alice",
    ]);
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("queued provision for u-1"));

    let queued = std::fs::read_dir(temp_dir.path().join("spool").join("queue"))
        .unwrap()
        .count();
    assert_eq!(queued, 1);

    let output = run_provisioner(&["--config", &config_path, "dead-letters"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("no dead-lettered tasks"));
}

#[test]
fn test_cli_enqueue_rejects_invalid_username() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = spool_config(temp_dir.path());

    let output = run_provisioner(&[
        "--config",
        &config_path,
        "enqueue",
        "provision",
        "--user-id",
        "u-1",
        "--username",
        "root",
    ]);
    assert!(!output.status.success(), "Reserved names must be rejected");
}

#[test]
fn test_cli_admin_rejects_mock_mode() {
    let output = run_provisioner(&["--mock", "admin", "approve", "--user-id", "nobody"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--mock"), "{stderr}");
}

#[test]
fn test_cli_admin_leaves_allocation_table_alone() {
    let temp_dir = TempDir::new().unwrap();
    let spool = temp_dir.path().join("spool").to_string_lossy().replace('\\', "/");
    let table = temp_dir.path().join("ports.json");
    let table_path = table.to_string_lossy().replace('\\', "/");
    let config_path = write_config(
        temp_dir.path(),
        &format!(
            r#"
logging:
  level: error
provisioning:
  call_timeout: 5s
  ports:
    store_path: "{table_path}"
  queue:
    spool_dir: "{spool}"
  directory:
    base_url: "http://127.0.0.1:9/v1.0"
    token_url: "http://127.0.0.1:9/token"
    client_id: "provisioner"
    client_secret: "secret"
"#
        ),
    );

    // Nothing listens on the discard port, so the directory call fails.
    let output = run_provisioner(&[
        "--config",
        &config_path,
        "admin",
        "approve",
        "--user-id",
        "u-1",
    ]);
    assert!(!output.status.success());
    assert!(!table.exists(), "admin must not write the allocation table");
}

#[cfg(unix)]
#[tokio::test]
async fn test_cli_run_mock_stops_on_sigterm() {
    let mut child = tokio::process::Command::new(env!("CARGO_BIN_EXE_provisioner-server"))
        .args(["--mock", "run"])
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let pid = child.id().unwrap();
    let status = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let exit = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("server did not stop after SIGTERM")
        .unwrap();
    assert!(exit.success(), "graceful shutdown should exit 0: {exit:?}");
}
