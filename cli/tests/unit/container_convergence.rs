//! Tests for the `convergence` and `readiness` application services.

#![allow(clippy::expect_used)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use keel_cli::application::services::convergence::ConvergenceAgent;
use keel_cli::application::services::readiness::{boot_marker_present, wait_ready};
use keel_cli::domain::error::error_code;
use keel_cli::domain::retry::{PollPolicy, RetryPolicy};
use keel_cli::domain::workload::ContainerAction;
use keel_common::{Endpoint, Readiness, RegistryCredentials};
use tokio_util::sync::CancellationToken;

use crate::helpers::{FakeHost, workload};

fn endpoint() -> Endpoint {
    Endpoint {
        address: "203.0.113.7".to_string(),
        instance_id: Some("i-0007".to_string()),
        readiness: Readiness::Ready,
    }
}

fn agent<'a>(host: &'a FakeHost, cancel: &'a CancellationToken) -> ConvergenceAgent<'a, FakeHost> {
    ConvergenceAgent::new(
        host,
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(4), 3),
        PollPolicy::new(Duration::from_secs(1), Duration::from_secs(10)),
        cancel,
    )
}

// ── Convergence ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_converge_starts_missing_container() {
    let host = FakeHost::default();
    let cancel = CancellationToken::new();

    let outcome = agent(&host, &cancel)
        .converge(&endpoint(), &workload(), None)
        .await
        .expect("converged");

    assert_eq!(outcome.action, ContainerAction::Started);
    assert_eq!(
        outcome.image_id,
        "sha256:registry.example.com/hello:1.4.2"
    );
    let runs = host.container_mutations();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].starts_with("sudo docker run -d --name hello --restart always -p 80:5000"));
    assert!(runs[0].contains("-e PORT=5000"));
}

#[tokio::test(start_paused = true)]
async fn test_converge_twice_keeps_running_container() {
    let host = FakeHost::default();
    let cancel = CancellationToken::new();
    let agent = agent(&host, &cancel);

    agent
        .converge(&endpoint(), &workload(), None)
        .await
        .expect("first");
    let second = agent
        .converge(&endpoint(), &workload(), None)
        .await
        .expect("second");

    assert_eq!(second.action, ContainerAction::Kept);
    assert_eq!(host.container_mutations().len(), 1, "no stop, remove or start");
}

#[tokio::test(start_paused = true)]
async fn test_converge_replaces_container_when_env_changes() {
    let host = FakeHost::default();
    let cancel = CancellationToken::new();
    let agent = agent(&host, &cancel);
    agent
        .converge(&endpoint(), &workload(), None)
        .await
        .expect("first");

    let mut changed = workload();
    changed.env.insert("GREETING".to_string(), "hi".to_string());
    let outcome = agent
        .converge(&endpoint(), &changed, None)
        .await
        .expect("second");

    assert_eq!(outcome.action, ContainerAction::Replaced);
    let mutations = host.container_mutations();
    assert_eq!(mutations.len(), 3);
    assert_eq!(mutations[1], "sudo docker rm -f hello");
    assert!(mutations[2].contains("-e GREETING=hi"));
}

#[tokio::test(start_paused = true)]
async fn test_converge_replaces_stopped_container() {
    let host = FakeHost::default();
    let cancel = CancellationToken::new();
    let agent = agent(&host, &cancel);
    agent
        .converge(&endpoint(), &workload(), None)
        .await
        .expect("first");
    if let Some(c) = host.state.lock().expect("host").containers.get_mut("hello") {
        c.status = "exited".to_string();
    }

    let outcome = agent
        .converge(&endpoint(), &workload(), None)
        .await
        .expect("second");

    assert_eq!(outcome.action, ContainerAction::Replaced);
}

#[tokio::test(start_paused = true)]
async fn test_converge_fails_when_container_never_runs() {
    let host = FakeHost::default();
    host.state.lock().expect("host").start_status = Some("restarting".to_string());
    let cancel = CancellationToken::new();

    let err = agent(&host, &cancel)
        .converge(&endpoint(), &workload(), None)
        .await
        .expect_err("container never reaches running");

    assert_eq!(error_code(&err), "convergence_error");
    assert!(format!("{err:#}").contains("did not report running"), "{err:#}");
}

#[tokio::test(start_paused = true)]
async fn test_converge_retries_connection_failures() {
    let host = FakeHost::default();
    host.state.lock().expect("host").connect_failures = 2;
    let cancel = CancellationToken::new();

    let outcome = agent(&host, &cancel)
        .converge(&endpoint(), &workload(), None)
        .await
        .expect("converged after reconnecting");

    assert_eq!(outcome.action, ContainerAction::Started);
}

#[tokio::test(start_paused = true)]
async fn test_converge_gives_up_after_connect_budget() {
    let host = FakeHost::default();
    host.state.lock().expect("host").connect_failures = 10;
    let cancel = CancellationToken::new();

    let err = agent(&host, &cancel)
        .converge(&endpoint(), &workload(), None)
        .await
        .expect_err("unreachable host");

    assert_eq!(error_code(&err), "connect_error");
    assert_eq!(host.state.lock().expect("host").connect_failures, 7);
}

#[tokio::test(start_paused = true)]
async fn test_private_registry_logs_in_with_password_on_stdin() {
    let host = FakeHost::default();
    let cancel = CancellationToken::new();
    let mut private = workload();
    private.registry_credentials = Some(RegistryCredentials {
        registry: "registry.example.com".to_string(),
        username: "deploy".to_string(),
        password_env: "REGISTRY_PASSWORD".to_string(),
    });

    agent(&host, &cancel)
        .converge(&endpoint(), &private, Some("s3cret"))
        .await
        .expect("converged");

    let commands = host.commands();
    let login = commands
        .iter()
        .position(|c| c.starts_with("sudo docker login registry.example.com --username deploy"))
        .expect("login issued");
    let pull = commands
        .iter()
        .position(|c| c.starts_with("sudo docker pull"))
        .expect("pull issued");
    assert!(login < pull);
    assert!(commands.iter().all(|c| !c.contains("s3cret")));
}

#[tokio::test(start_paused = true)]
async fn test_private_registry_without_password_fails_before_pull() {
    let host = FakeHost::default();
    let cancel = CancellationToken::new();
    let mut private = workload();
    private.registry_credentials = Some(RegistryCredentials {
        registry: "registry.example.com".to_string(),
        username: "deploy".to_string(),
        password_env: "REGISTRY_PASSWORD".to_string(),
    });

    let err = agent(&host, &cancel)
        .converge(&endpoint(), &private, None)
        .await
        .expect_err("missing password");

    assert_eq!(error_code(&err), "convergence_error");
    assert!(format!("{err}").contains("REGISTRY_PASSWORD"));
    assert!(host.commands().iter().all(|c| !c.starts_with("sudo docker pull")));
}

// ── Readiness ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_wait_ready_succeeds_on_poll_after_last_not_ready() {
    let policy = PollPolicy::new(Duration::from_secs(10), Duration::from_secs(300));
    let cancel = CancellationToken::new();
    let mut ep = endpoint();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    let polls = wait_ready(&mut ep, &policy, &cancel, move |_host| async move {
        Ok(calls.fetch_add(1, Ordering::SeqCst) >= 4)
    })
    .await
    .expect("ready");

    assert_eq!(polls, 5);
    assert_eq!(ep.readiness, Readiness::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_wait_ready_treats_probe_errors_as_not_ready() {
    let policy = PollPolicy::new(Duration::from_secs(10), Duration::from_secs(300));
    let cancel = CancellationToken::new();
    let mut ep = endpoint();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    let polls = wait_ready(&mut ep, &policy, &cancel, move |_host| async move {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("connection refused")
        }
        Ok(true)
    })
    .await
    .expect("ready");

    assert_eq!(polls, 2);
}

#[tokio::test(start_paused = true)]
async fn test_wait_ready_times_out_and_marks_endpoint_failed() {
    let policy = PollPolicy::new(Duration::from_secs(10), Duration::from_secs(60));
    let cancel = CancellationToken::new();
    let mut ep = endpoint();
    let start = tokio::time::Instant::now();

    let err = wait_ready(&mut ep, &policy, &cancel, |_host| async { Ok(false) })
        .await
        .expect_err("never ready");

    assert_eq!(error_code(&err), "timeout");
    assert_eq!(ep.readiness, Readiness::Failed);
    assert!(start.elapsed() <= Duration::from_secs(70));
}

#[tokio::test(start_paused = true)]
async fn test_boot_marker_reflects_remote_test_exit_status() {
    let host = FakeHost::booting_for(1);

    assert!(!boot_marker_present(&host, "203.0.113.7").await.expect("first"));
    assert!(boot_marker_present(&host, "203.0.113.7").await.expect("second"));
    assert_eq!(
        host.commands(),
        vec![
            "test -f /var/lib/keel/bootstrap-complete".to_string(),
            "test -f /var/lib/keel/bootstrap-complete".to_string(),
        ]
    );
}
