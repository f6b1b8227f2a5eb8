//! Integration tests for the keel CLI surface: help, version, exit codes.

#![allow(clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;

fn keel() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("keel"));
    cmd.env("NO_COLOR", "1");
    cmd
}

// --- Help and version tests ---

#[test]
fn test_cli_no_args_shows_help_and_exits_two() {
    keel().assert().code(2).stderr(predicate::str::contains(
        "Lock-guarded infrastructure convergence and container rollout",
    ));
}

#[test]
fn test_cli_help_lists_commands() {
    let output = keel().arg("--help").output().expect("run keel");
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for command in [
        "plan", "deploy", "destroy", "approve", "reject", "status", "unlock", "config", "version",
    ] {
        assert!(help.contains(command), "missing {command} in:\n{help}");
    }
}

#[test]
fn test_cli_version_flag_shows_version() {
    keel()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("keel"));
}

#[test]
fn test_version_command_shows_version() {
    keel()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("keel v0.1.0"));
}

#[test]
fn test_version_command_json_outputs_valid_json() {
    let output = keel()
        .args(["version", "--json"])
        .output()
        .expect("run keel");
    assert!(output.status.success());
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is one JSON document");
    assert_eq!(value["version"], "0.1.0");
}

#[test]
fn test_unknown_subcommand_is_a_usage_error() {
    keel()
        .arg("launch")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_deploy_requires_manifest() {
    keel()
        .arg("deploy")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--manifest"));
}

#[test]
fn test_destroy_help_mentions_yes_flag() {
    keel()
        .args(["destroy", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--yes"));
}

#[test]
fn test_any_no_color_value_is_accepted() {
    for value in ["1", "true", "yes", "0", ""] {
        Command::new(assert_cmd::cargo::cargo_bin!("keel"))
            .env("NO_COLOR", value)
            .arg("version")
            .assert()
            .success()
            .stdout(predicate::str::contains("keel v0.1.0"));
    }
}
