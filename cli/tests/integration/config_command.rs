//! Integration tests for `keel config` command.
//!
//! All filesystem-touching tests set `KEEL_CONFIG` to a temp path so they
//! never read or write `~/.keel/config.yaml`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn keel() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("keel"));
    cmd.env("NO_COLOR", "1");
    cmd
}

/// Returns a `TempDir` and the path string for a config file inside it.
fn temp_config_path() -> (TempDir, String) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir
        .path()
        .join("config.yaml")
        .to_string_lossy()
        .into_owned();
    (dir, path)
}

// ---------------------------------------------------------------------------
// `keel config show`
// ---------------------------------------------------------------------------

#[test]
fn test_config_help_shows_show_and_set_subcommands() {
    keel()
        .args(["config", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("show"))
        .stdout(predicate::str::contains("set"));
}

#[test]
fn test_config_show_without_file_lists_defaults() {
    let (_dir, path) = temp_config_path();
    keel()
        .args(["config", "show"])
        .env("KEEL_CONFIG", &path)
        .assert()
        .success()
        .stdout(predicate::str::contains("lock.ttl_secs"))
        .stdout(predicate::str::contains("readiness.timeout_secs"))
        .stdout(predicate::str::contains("KEEL_STATE_DB"));
}

#[test]
fn test_config_show_json_is_the_config_document() {
    let (_dir, path) = temp_config_path();
    let output = keel()
        .args(["config", "show", "--json"])
        .env("KEEL_CONFIG", &path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(value["lock"]["ttl_secs"].is_u64());
    assert!(value["approval"]["timeout_secs"].is_u64());
}

// ---------------------------------------------------------------------------
// `keel config set`
// ---------------------------------------------------------------------------

#[test]
fn test_config_set_persists_value() {
    let (_dir, path) = temp_config_path();
    keel()
        .args(["config", "set", "lock.ttl_secs", "1234"])
        .env("KEEL_CONFIG", &path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Set lock.ttl_secs = 1234"));

    let saved = std::fs::read_to_string(&path).unwrap();
    assert!(saved.contains("ttl_secs: 1234"), "{saved}");

    keel()
        .args(["config", "show"])
        .env("KEEL_CONFIG", &path)
        .assert()
        .success()
        .stdout(predicate::str::contains("1234"));
}

#[test]
fn test_config_set_approvers_for_target() {
    let (_dir, path) = temp_config_path();
    keel()
        .args(["config", "set", "approval.approvers.production", "alice,bob"])
        .env("KEEL_CONFIG", &path)
        .assert()
        .success();

    keel()
        .args(["config", "show"])
        .env("KEEL_CONFIG", &path)
        .assert()
        .success()
        .stdout(predicate::str::contains("approval.approvers.production"))
        .stdout(predicate::str::contains("alice,bob"));
}

#[test]
fn test_config_set_unknown_key_fails() {
    let (_dir, path) = temp_config_path();
    keel()
        .args(["config", "set", "lock.colour", "blue"])
        .env("KEEL_CONFIG", &path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown setting: lock.colour"));
    assert!(!std::path::Path::new(&path).exists());
}

#[test]
fn test_config_set_invalid_value_fails() {
    let (_dir, path) = temp_config_path();
    keel()
        .args(["config", "set", "retry.max_attempts", "0"])
        .env("KEEL_CONFIG", &path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid value for retry.max_attempts"));
}

#[test]
fn test_config_set_json_error_object() {
    let (_dir, path) = temp_config_path();
    let output = keel()
        .args(["config", "set", "lock.colour", "blue", "--json"])
        .env("KEEL_CONFIG", &path)
        .output()
        .unwrap();
    assert!(!output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["error"], true);
    assert_eq!(value["code"], "internal");
}
