//! End-to-end runs through the orchestrator against in-memory adapters.
//!
//! Every test runs on a paused clock, so polls and back-offs complete
//! instantly while keeping their ordering.

#![allow(clippy::expect_used)]

use std::time::Duration;

use keel_cli::application::ports::{ApprovalChannel, LockManager};
use keel_cli::application::services::decision::decide;
use keel_cli::application::services::orchestrator::{Orchestrator, RunRequest};
use keel_cli::domain::error::ProviderError;
use keel_common::{Action, Readiness, ResourceKind, RunKind, RunStage, Verdict};
use tokio_util::sync::CancellationToken;

use crate::helpers::{
    FakeCloud, FakeHost, FakeProber, MemoryStore, RUN_ID, RecordingReporter, SECOND_RUN_ID,
    deploy_request, settings,
};

fn stages(report: &keel_common::RunReport) -> Vec<RunStage> {
    report.stages.iter().map(|t| t.to).collect()
}

fn failure_code(report: &keel_common::RunReport) -> Option<&str> {
    report.failure.as_ref().map(|f| f.code.as_str())
}

// ── Deploy ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_first_deploy_provisions_converges_and_verifies() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::booting_for(2),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let report = orchestrator
        .run(&deploy_request(RUN_ID, "staging", "carol"))
        .await;

    assert_eq!(report.final_state, RunStage::Done, "{:?}", report.failure);
    assert_eq!(
        stages(&report),
        vec![
            RunStage::Locking,
            RunStage::Planning,
            RunStage::Provisioning,
            RunStage::Discovering,
            RunStage::WaitingReady,
            RunStage::Converging,
            RunStage::Verifying,
            RunStage::Done,
            RunStage::Released,
        ]
    );
    assert!(report.lock_released);
    assert!(store.lock_of("staging").is_none());
    assert_eq!(store.generations("staging"), vec![1]);
    assert_eq!(cloud.live_instances(), 1);

    let endpoint = report.endpoint.clone().expect("endpoint");
    assert_eq!(endpoint.readiness, Readiness::Ready);
    assert_eq!(
        host.state.lock().expect("host").boot_checks,
        3,
        "two not-ready polls then ready"
    );
    assert_eq!(
        host.state.lock().expect("host").forgotten,
        vec![endpoint.address.clone()]
    );
    assert_eq!(
        host.container("hello").map(|c| c.status),
        Some("running".to_string())
    );
    let verification = report.verification.as_ref().expect("verification");
    assert!(verification.passed);
    assert_eq!(verification.probes.len(), 2);
    assert_eq!(store.journal().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_deploy_changes_nothing() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let first = orchestrator
        .run(&deploy_request(RUN_ID, "staging", "carol"))
        .await;
    assert!(first.succeeded(), "{:?}", first.failure);
    let mutations_after_first = cloud.mutations();
    let containers_after_first = host.container_mutations();

    let second = orchestrator
        .run(&deploy_request(SECOND_RUN_ID, "staging", "carol"))
        .await;

    assert!(second.succeeded(), "{:?}", second.failure);
    let changes = second.change_set.as_ref().expect("change set");
    assert!(changes.is_empty());
    assert!(changes.operations.iter().all(|op| op.action == Action::Noop));
    assert_eq!(cloud.mutations(), mutations_after_first);
    assert_eq!(host.container_mutations(), containers_after_first);
    assert_eq!(store.generations("staging"), vec![1], "no new generation");
    assert_eq!(
        second.endpoint.map(|e| e.address),
        first.endpoint.map(|e| e.address)
    );
}

#[tokio::test(start_paused = true)]
async fn test_changed_instance_class_replaces_instance_only() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);
    assert!(
        orchestrator
            .run(&deploy_request(RUN_ID, "staging", "carol"))
            .await
            .succeeded()
    );

    let mut request = deploy_request(SECOND_RUN_ID, "staging", "carol");
    if let Some(m) = request.manifest.as_mut() {
        m.topology.instance_class = "t3.small".to_string();
    }
    let report = orchestrator.run(&request).await;

    assert!(report.succeeded(), "{:?}", report.failure);
    let summary = report.change_set.expect("change set").summary();
    assert_eq!(
        summary,
        vec![
            (ResourceKind::Instance, Action::Destroy),
            (ResourceKind::Instance, Action::Create),
        ]
    );
    assert_eq!(cloud.live_instances(), 1);
    assert_eq!(store.generations("staging"), vec![1, 2]);
    let instance = store
        .latest("staging")
        .and_then(|s| s.resources.instance)
        .expect("instance");
    assert_eq!(instance.class, "t3.small");
}

// ── Preview ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_preview_plans_without_touching_anything() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let request = RunRequest {
        kind: RunKind::Preview,
        ..deploy_request(RUN_ID, "staging", "carol")
    };
    let report = orchestrator.run(&request).await;

    assert!(report.succeeded(), "{:?}", report.failure);
    let summary = report.change_set.expect("change set").summary();
    assert_eq!(
        summary,
        vec![
            (ResourceKind::CredentialPair, Action::Create),
            (ResourceKind::NetworkPolicy, Action::Create),
            (ResourceKind::Instance, Action::Create),
        ]
    );
    assert!(cloud.calls().is_empty());
    assert!(host.commands().is_empty());
    assert_eq!(prober.request_count(), 0);
    assert!(store.latest("staging").is_none());
    assert!(report.lock_released);
}

// ── Destroy ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_destroy_tears_down_in_reverse_dependency_order() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);
    assert!(
        orchestrator
            .run(&deploy_request(RUN_ID, "staging", "carol"))
            .await
            .succeeded()
    );
    let created = cloud.calls().len();

    let report = orchestrator
        .run(&RunRequest {
            run_id: SECOND_RUN_ID.to_string(),
            kind: RunKind::Destroy,
            target: "staging".to_string(),
            initiator: "carol".to_string(),
            manifest: None,
            registry_password: None,
        })
        .await;

    assert!(report.succeeded(), "{:?}", report.failure);
    let teardown: Vec<String> = cloud.calls()[created..]
        .iter()
        .filter(|c| !c.starts_with("describe_instance"))
        .map(|c| c.split(' ').next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        teardown,
        vec![
            "terminate_instance",
            "delete_security_group",
            "delete_key_pair"
        ]
    );
    assert_eq!(cloud.live_instances(), 0);
    let latest = store.latest("staging").expect("snapshot");
    assert_eq!(latest.generation, 2);
    assert!(latest.resources.is_empty());
    assert!(!latest.partial);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_of_unknown_target_is_a_noop() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let report = orchestrator
        .run(&RunRequest {
            run_id: RUN_ID.to_string(),
            kind: RunKind::Destroy,
            target: "nowhere".to_string(),
            initiator: "carol".to_string(),
            manifest: None,
            registry_password: None,
        })
        .await;

    assert!(report.succeeded());
    assert!(cloud.calls().is_empty());
    assert!(store.latest("nowhere").is_none());
    assert!(
        reporter
            .events()
            .iter()
            .any(|e| e == "ok: nothing to destroy")
    );
}

// ── Failures ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_lock_held_by_another_run_fails_fast() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    store
        .acquire_lock("staging", "run-00000000000000ff", Duration::from_secs(600))
        .await
        .expect("pre-existing lock");
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let report = orchestrator
        .run(&deploy_request(RUN_ID, "staging", "carol"))
        .await;

    assert_eq!(report.final_state, RunStage::Failed);
    assert_eq!(failure_code(&report), Some("lock_held"));
    assert_eq!(
        report.failure.as_ref().map(|f| f.stage),
        Some(RunStage::Locking)
    );
    assert!(!report.lock_released);
    assert_eq!(
        store.lock_of("staging").map(|l| l.holder_id),
        Some("run-00000000000000ff".to_string()),
        "the other run keeps its lock"
    );
    assert!(cloud.calls().is_empty());
    assert_eq!(store.journal().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resuming_a_run_id_that_still_holds_the_lock_fails() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    let live = store
        .acquire_lock("staging", RUN_ID, Duration::from_secs(600))
        .await
        .expect("original process holds the lock");
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let report = orchestrator
        .run(&deploy_request(RUN_ID, "staging", "carol"))
        .await;

    assert_eq!(failure_code(&report), Some("lock_held"));
    assert!(cloud.calls().is_empty());
    assert_eq!(
        store.lock_of("staging").map(|l| l.acquired_at),
        Some(live.acquired_at),
        "the original token stays valid"
    );
}

#[tokio::test(start_paused = true)]
async fn test_lock_is_refreshed_before_each_long_stage() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let report = orchestrator
        .run(&deploy_request(RUN_ID, "staging", "carol"))
        .await;

    assert!(report.succeeded(), "{:?}", report.failure);
    // Provisioning, readiness, convergence and verification each renew it.
    assert_eq!(store.refreshes(), 4);
    assert!(report.lock_released);
}

#[tokio::test(start_paused = true)]
async fn test_lock_lost_mid_run_stops_before_convergence() {
    let (store, cloud, host, prober) = (
        MemoryStore::losing_lock_at_refresh(3),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let report = orchestrator
        .run(&deploy_request(RUN_ID, "staging", "carol"))
        .await;

    assert_eq!(report.final_state, RunStage::Failed);
    assert_eq!(failure_code(&report), Some("lock_lost"));
    assert_eq!(
        report.failure.as_ref().map(|f| f.stage),
        Some(RunStage::WaitingReady)
    );
    assert!(host.container_mutations().is_empty());
    assert_eq!(prober.request_count(), 0);
    assert_eq!(store.generations("staging"), vec![1], "applied state is kept");
}

#[tokio::test(start_paused = true)]
async fn test_expired_lock_is_taken_over() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    store
        .acquire_lock("staging", "run-00000000000000ff", Duration::ZERO)
        .await
        .expect("stale lock");
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let report = orchestrator
        .run(&deploy_request(RUN_ID, "staging", "carol"))
        .await;

    assert!(report.succeeded(), "{:?}", report.failure);
    assert!(report.lock_released);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_provider_error_persists_partial_state_and_resumes() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    cloud.fail(
        "run_instance",
        vec![ProviderError::Terminal(
            "InstanceLimitExceeded: You have requested more instances than allowed".to_string(),
        )],
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let failed = orchestrator
        .run(&deploy_request(RUN_ID, "staging", "carol"))
        .await;

    assert_eq!(failed.final_state, RunStage::Failed);
    assert_eq!(failure_code(&failed), Some("provider_terminal"));
    assert_eq!(
        failed.failure.as_ref().map(|f| f.stage),
        Some(RunStage::Provisioning)
    );
    assert!(failed.lock_released);
    let partial = store.latest("staging").expect("partial snapshot");
    assert!(partial.partial);
    assert!(partial.resources.credential_pair.is_some());
    assert!(partial.resources.network_policy.is_some());
    assert!(partial.resources.instance.is_none());

    let resumed = orchestrator
        .run(&deploy_request(SECOND_RUN_ID, "staging", "carol"))
        .await;

    assert!(resumed.succeeded(), "{:?}", resumed.failure);
    let summary = resumed.change_set.expect("change set").summary();
    assert_eq!(summary, vec![(ResourceKind::Instance, Action::Create)]);
    let latest = store.latest("staging").expect("snapshot");
    assert_eq!(latest.generation, 2);
    assert!(!latest.partial);
}

#[tokio::test(start_paused = true)]
async fn test_transient_provider_errors_are_retried() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    cloud.fail(
        "run_instance",
        vec![
            ProviderError::Transient("RequestLimitExceeded".to_string()),
            ProviderError::Transient("RequestLimitExceeded".to_string()),
        ],
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let report = orchestrator
        .run(&deploy_request(RUN_ID, "staging", "carol"))
        .await;

    assert!(report.succeeded(), "{:?}", report.failure);
    let launches = cloud
        .calls()
        .iter()
        .filter(|c| c.starts_with("run_instance"))
        .count();
    assert_eq!(launches, 3);
    assert_eq!(cloud.live_instances(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_fails_the_run_after_all_attempts() {
    let (store, cloud, host) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
    );
    let prober = FakeProber::serving("/", 502, "Bad Gateway");
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let report = orchestrator
        .run(&deploy_request(RUN_ID, "staging", "carol"))
        .await;

    assert_eq!(report.final_state, RunStage::Failed);
    assert_eq!(failure_code(&report), Some("verification_failed"));
    let verification = report.verification.expect("verification recorded");
    assert!(!verification.passed);
    let root = &verification.probes[0];
    assert!(!root.passed);
    assert_eq!(root.status, Some(502));
    assert_eq!(root.attempts, 2);
    assert!(report.lock_released);
    assert_eq!(store.generations("staging"), vec![1], "infrastructure kept");
}

#[tokio::test(start_paused = true)]
async fn test_instance_that_never_boots_times_out_readiness() {
    let (store, cloud, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeProber::default(),
    );
    let host = FakeHost::booting_for(u32::MAX);
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let report = orchestrator
        .run(&deploy_request(RUN_ID, "staging", "carol"))
        .await;

    assert_eq!(failure_code(&report), Some("timeout"));
    assert_eq!(
        report.failure.as_ref().map(|f| f.stage),
        Some(RunStage::WaitingReady)
    );
    assert_eq!(
        report.endpoint.map(|e| e.readiness),
        Some(Readiness::Failed)
    );
    assert!(host.container_mutations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_stops_and_releases_lock() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::booting_for(u32::MAX),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, settings(), &cancel);

    let canceller = async {
        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();
    };
    let req = deploy_request(RUN_ID, "staging", "carol");
    let (report, ()) = tokio::join!(
        orchestrator.run(&req),
        canceller
    );

    assert_eq!(failure_code(&report), Some("cancelled"));
    assert!(report.lock_released);
    assert!(store.lock_of("staging").is_none());
}

// ── Approval ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_gated_run_proceeds_after_approval() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let mut gated = settings();
    gated.approvers = vec!["alice".to_string(), "bob".to_string()];
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, gated, &cancel);

    let approver = async {
        while store.request(RUN_ID).await.expect("read").is_none() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(cloud.mutations().is_empty(), "nothing applied before approval");
        decide(&store, RUN_ID, "alice", Verdict::Approved, None)
            .await
            .expect("decision recorded");
    };
    let req = deploy_request(RUN_ID, "production", "carol");
    let (report, ()) = tokio::join!(
        orchestrator.run(&req),
        approver
    );

    assert!(report.succeeded(), "{:?}", report.failure);
    assert!(stages(&report).contains(&RunStage::AwaitingApproval));
    assert!(
        reporter
            .events()
            .iter()
            .any(|e| e == "ok: approved by alice")
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_run_fails_without_provisioning() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let mut gated = settings();
    gated.approvers = vec!["alice".to_string(), "bob".to_string()];
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, gated, &cancel);

    let reviewers = async {
        while store.request(RUN_ID).await.expect("read").is_none() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        decide(
            &store,
            RUN_ID,
            "bob",
            Verdict::Rejected,
            Some("not during the freeze".to_string()),
        )
        .await
        .expect("rejection recorded");
        decide(&store, RUN_ID, "alice", Verdict::Approved, None)
            .await
            .expect("approval recorded");
    };
    let req = deploy_request(RUN_ID, "production", "carol");
    let (report, ()) = tokio::join!(
        orchestrator.run(&req),
        reviewers
    );

    assert_eq!(failure_code(&report), Some("approval_rejected"));
    assert_eq!(
        report.failure.as_ref().map(|f| f.stage),
        Some(RunStage::AwaitingApproval)
    );
    assert!(cloud.mutations().is_empty());
    assert!(store.latest("production").is_none());
    assert!(report.lock_released);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_approval_times_out() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let mut gated = settings();
    gated.approvers = vec!["alice".to_string()];
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, gated, &cancel);

    let report = orchestrator
        .run(&deploy_request(RUN_ID, "production", "carol"))
        .await;

    assert_eq!(failure_code(&report), Some("approval_timeout"));
    assert!(cloud.mutations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_preview_is_never_gated() {
    let (store, cloud, host, prober) = (
        MemoryStore::default(),
        FakeCloud::default(),
        FakeHost::default(),
        FakeProber::default(),
    );
    let reporter = RecordingReporter::default();
    let cancel = CancellationToken::new();
    let mut gated = settings();
    gated.approvers = vec!["alice".to_string()];
    let orchestrator =
        Orchestrator::new(&store, &cloud, &host, &prober, &reporter, gated, &cancel);

    let report = orchestrator
        .run(&RunRequest {
            kind: RunKind::Preview,
            ..deploy_request(RUN_ID, "production", "carol")
        })
        .await;

    assert!(report.succeeded());
    assert!(!stages(&report).contains(&RunStage::AwaitingApproval));
    assert!(store.request(RUN_ID).await.expect("read").is_none());
}
