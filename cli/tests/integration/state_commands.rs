//! Integration tests for the commands that read or edit the state database:
//! `status`, `unlock`, `approve` and the manifest handling of `plan`.
//!
//! Every test points `KEEL_CONFIG` and `KEEL_STATE_DB` into its own temp
//! directory, so nothing under `~/.keel` is touched.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn keel(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("keel"));
        cmd.env("NO_COLOR", "1")
            .env("CI", "1")
            .env("KEEL_ACTOR", "alice")
            .env("KEEL_CONFIG", self.path("config.yaml"))
            .env("KEEL_STATE_DB", self.path("state.db"));
        cmd
    }
}

// ---------------------------------------------------------------------------
// `keel status`
// ---------------------------------------------------------------------------

#[test]
fn test_status_of_unknown_target_is_empty() {
    let sandbox = Sandbox::new();
    sandbox
        .keel()
        .args(["status", "staging"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Target staging"))
        .stdout(predicate::str::contains("(never applied)"))
        .stdout(predicate::str::contains("free"));
    assert!(sandbox.path("state.db").exists(), "database created on open");
}

#[test]
fn test_status_json_of_unknown_target() {
    let sandbox = Sandbox::new();
    let output = sandbox
        .keel()
        .args(["status", "staging", "--json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["target"], "staging");
    assert!(value["snapshot"].is_null());
    assert!(value["lock"].is_null());
    assert_eq!(value["recent_runs"], serde_json::json!([]));
}

#[test]
fn test_status_rejects_invalid_target_key() {
    let sandbox = Sandbox::new();
    sandbox
        .keel()
        .args(["status", "Not_A_Target"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

// ---------------------------------------------------------------------------
// `keel unlock`
// ---------------------------------------------------------------------------

#[test]
fn test_unlock_when_not_locked_is_informational() {
    let sandbox = Sandbox::new();
    sandbox
        .keel()
        .args(["unlock", "staging"])
        .assert()
        .success()
        .stdout(predicate::str::contains("staging is not locked"));
}

#[test]
fn test_unlock_json_reports_nothing_released() {
    let sandbox = Sandbox::new();
    let output = sandbox
        .keel()
        .args(["unlock", "staging", "--json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["target"], "staging");
    assert_eq!(value["released"], false);
}

// ---------------------------------------------------------------------------
// `keel approve` / `keel reject`
// ---------------------------------------------------------------------------

#[test]
fn test_approve_unknown_run_fails() {
    let sandbox = Sandbox::new();
    sandbox
        .keel()
        .args(["approve", "run-00000000000000a1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "run run-00000000000000a1 is not waiting for approval",
        ));
}

#[test]
fn test_reject_unknown_run_json_error() {
    let sandbox = Sandbox::new();
    let output = sandbox
        .keel()
        .args(["reject", "run-00000000000000a1", "--json"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["error"], true);
    assert!(
        value["message"]
            .as_str()
            .unwrap()
            .contains("is not waiting for approval")
    );
}

#[test]
fn test_approve_rejects_malformed_run_id() {
    let sandbox = Sandbox::new();
    sandbox
        .keel()
        .args(["approve", "not-a-run"])
        .assert()
        .failure();
}

// ---------------------------------------------------------------------------
// Manifest handling
// ---------------------------------------------------------------------------

#[test]
fn test_plan_with_missing_manifest_fails() {
    let sandbox = Sandbox::new();
    let missing = sandbox.path("absent.yaml");
    sandbox
        .keel()
        .args(["plan", "--manifest"])
        .arg(&missing)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot read manifest"));
}

#[test]
fn test_plan_with_invalid_manifest_fails() {
    let sandbox = Sandbox::new();
    let manifest = sandbox.path("keel.yaml");
    std::fs::write(&manifest, "target: staging\ntopology: [not, a, map]\n").unwrap();
    sandbox
        .keel()
        .args(["plan", "-m"])
        .arg(&manifest)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid manifest"));
}

// ---------------------------------------------------------------------------
// Initiator identity
// ---------------------------------------------------------------------------

#[test]
fn test_destroy_refuses_initiator_other_than_actor() {
    let sandbox = Sandbox::new();
    sandbox
        .keel()
        .args(["destroy", "staging", "--yes", "--initiator", "bob"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains(
            "--initiator bob does not match the acting identity alice",
        ));
    assert!(
        !sandbox.path("state.db").exists(),
        "refused before any run state is touched"
    );
}
