//! The deployment run: lock, plan, approve, provision, discover, wait,
//! converge, verify, release.
//!
//! [`Orchestrator::run`] never fails. Every error ends the run in the
//! `failed` stage with a stable code, and lock release runs regardless.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use keel_common::{
    Action, ApprovalRequest, ChangeSet, Lock, ProvisionedResources, ResourceKind, RunKind,
    RunReport, RunStage, StateSnapshot,
};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    ApprovalChannel, CloudProvider, HttpProber, LockManager, ProgressReporter, RemoteExecutor,
    RunJournal, StateStore,
};
use crate::application::services::approval_gate::await_approval;
use crate::application::services::convergence::ConvergenceAgent;
use crate::application::services::discovery::discover;
use crate::application::services::poll::{Polled, poll_until};
use crate::application::services::provision::Provisioner;
use crate::application::services::readiness::{boot_marker_present, wait_ready};
use crate::application::services::verifier::verify;
use crate::domain::config::KeelConfig;
use crate::domain::error::{DeployError, error_code};
use crate::domain::manifest::DeploymentManifest;
use crate::domain::planner::{plan, plan_teardown};
use crate::domain::retry::{PollPolicy, RetryPolicy};
use crate::domain::run::DeploymentRun;
use crate::domain::verify::ProbePolicy;

/// Timings and budgets for one run, resolved from config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub lock_ttl: Duration,
    pub lock_wait: PollPolicy,
    pub provider_retry: RetryPolicy,
    pub instance_poll: PollPolicy,
    pub readiness: PollPolicy,
    pub connect_retry: RetryPolicy,
    pub container_poll: PollPolicy,
    pub probes: ProbePolicy,
    pub approval: PollPolicy,
    /// Empty means the target has no approval gate.
    pub approvers: Vec<String>,
}

impl RunSettings {
    #[must_use]
    pub fn from_config(config: &KeelConfig, target: &str) -> Self {
        Self {
            lock_ttl: config.lock_ttl(),
            lock_wait: config.lock_wait(),
            provider_retry: config.provider_retry(),
            instance_poll: config.instance_poll(),
            readiness: config.readiness_poll(),
            connect_retry: config.connect_retry(),
            container_poll: config.container_poll(),
            probes: config.probe_policy(),
            approval: config.approval_poll(),
            approvers: config.approvers_for(target).to_vec(),
        }
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub kind: RunKind,
    pub target: String,
    pub initiator: String,
    /// Required for preview and deploy runs.
    pub manifest: Option<DeploymentManifest>,
    pub registry_password: Option<String>,
}

pub struct Orchestrator<'a, S, P, R, H, Rep> {
    store: &'a S,
    provider: &'a P,
    remote: &'a R,
    prober: &'a H,
    reporter: &'a Rep,
    settings: RunSettings,
    cancel: &'a CancellationToken,
}

impl<'a, S, P, R, H, Rep> Orchestrator<'a, S, P, R, H, Rep>
where
    S: StateStore + LockManager + ApprovalChannel + RunJournal,
    P: CloudProvider,
    R: RemoteExecutor,
    H: HttpProber,
    Rep: ProgressReporter,
{
    #[must_use]
    pub fn new(
        store: &'a S,
        provider: &'a P,
        remote: &'a R,
        prober: &'a H,
        reporter: &'a Rep,
        settings: RunSettings,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            provider,
            remote,
            prober,
            reporter,
            settings,
            cancel,
        }
    }

    /// Drive `request` to a terminal stage and return its report.
    ///
    /// The report is also appended to the run journal.
    pub async fn run(&self, request: &RunRequest) -> RunReport {
        let mut run = DeploymentRun::new(
            &request.run_id,
            &request.target,
            request.kind,
            &request.initiator,
            Utc::now(),
        );
        tracing::info!(
            run_id = %request.run_id,
            target_key = %request.target,
            kind = request.kind.as_str(),
            "run started"
        );

        let lock_released = match self.acquire(&mut run).await {
            Ok(mut lock) => {
                if let Err(e) = self.drive(&mut run, request, &mut lock).await {
                    self.fail(&mut run, &e);
                }
                self.release(&lock).await
            }
            Err(e) => {
                self.fail(&mut run, &e);
                false
            }
        };

        let report = run.finish(lock_released, Utc::now());
        if let Err(e) = self.store.record_run(&report).await {
            tracing::warn!(run_id = %report.run_id, error = %e, "cannot journal run report");
        }
        tracing::info!(
            run_id = %report.run_id,
            final_state = %report.final_state,
            lock_released,
            "run finished"
        );
        report
    }

    // ── Stages ────────────────────────────────────────────────────────────

    async fn acquire(&self, run: &mut DeploymentRun) -> Result<Lock> {
        self.advance(run, RunStage::Locking)?;
        self.reporter
            .step(&format!("acquiring lock on {}...", run.target_key));

        let store = self.store;
        let target = run.target_key.as_str();
        let holder = run.run_id.as_str();
        let ttl = self.settings.lock_ttl;
        let polled = poll_until(&self.settings.lock_wait, self.cancel, move || async move {
            match store.acquire_lock(target, holder, ttl).await {
                Ok(lock) => Some(Ok(lock)),
                Err(e) if error_code(&e) == "lock_held" => {
                    tracing::debug!(target_key = target, error = %e, "lock busy");
                    None
                }
                Err(e) => Some(Err(e)),
            }
        })
        .await?;
        let lock = match polled {
            Polled::Ready { value, .. } => value?,
            Polled::TimedOut { .. } => store.acquire_lock(target, holder, ttl).await?,
        };
        self.reporter.success(&format!("lock acquired on {target}"));
        Ok(lock)
    }

    async fn drive(
        &self,
        run: &mut DeploymentRun,
        request: &RunRequest,
        lock: &mut Lock,
    ) -> Result<()> {
        let target = request.target.clone();
        let manifest = match request.kind {
            RunKind::Destroy => None,
            RunKind::Preview | RunKind::Deploy => Some(request.manifest.as_ref().ok_or_else(
                || anyhow::anyhow!("{} run needs a manifest", request.kind.as_str()),
            )?),
        };

        // ── Planning ──
        self.advance(run, RunStage::Planning)?;
        let current = self
            .store
            .read_state(&target)
            .await?
            .unwrap_or_else(|| StateSnapshot::empty(&target));
        let changes = match manifest {
            Some(m) => plan(&m.topology, &current)?,
            None => plan_teardown(&current)?,
        };
        self.report_plan(&changes);
        run.change_set = Some(changes.clone());
        run.snapshot = Some(current.clone());

        if request.kind == RunKind::Preview {
            return self.advance(run, RunStage::Done);
        }
        if request.kind == RunKind::Destroy && changes.is_empty() && !current.partial {
            self.reporter.success("nothing to destroy");
            return self.advance(run, RunStage::Done);
        }

        // ── Approval ──
        if !self.settings.approvers.is_empty() {
            self.advance(run, RunStage::AwaitingApproval)?;
            self.reporter.step(&format!(
                "waiting for approval of {} (keel approve {})",
                run.run_id, run.run_id
            ));
            let approval = ApprovalRequest {
                run_id: run.run_id.clone(),
                target_key: target.clone(),
                initiator: run.initiator.clone(),
                required_approvers: self.settings.approvers.clone(),
                requested_at: Utc::now(),
            };
            let actor =
                await_approval(self.store, &approval, &self.settings.approval, self.cancel).await?;
            self.reporter.success(&format!("approved by {actor}"));
        }
        self.heartbeat(lock).await?;

        // ── Provisioning ──
        self.advance(run, RunStage::Provisioning)?;
        let snapshot = self.provision(run, &target, &changes, &current).await?;

        if request.kind == RunKind::Destroy {
            self.reporter.success(&format!("{target} torn down"));
            return self.advance(run, RunStage::Done);
        }
        let Some(manifest) = manifest else {
            return self.advance(run, RunStage::Done);
        };

        // ── Discovering ──
        self.advance(run, RunStage::Discovering)?;
        let mut endpoint = discover(
            self.provider,
            &snapshot,
            &self.settings.provider_retry,
            self.cancel,
        )
        .await?;
        run.endpoint = Some(endpoint.clone());
        if creates_instance(&changes) {
            if let Err(e) = self.remote.forget_host(&endpoint.address).await {
                tracing::warn!(address = %endpoint.address, error = %e, "cannot clear pinned host key");
            }
        }

        // ── Waiting for readiness ──
        self.heartbeat(lock).await?;
        self.advance(run, RunStage::WaitingReady)?;
        self.reporter
            .step(&format!("waiting for {} to finish booting...", endpoint.address));
        let remote = self.remote;
        let waited = wait_ready(
            &mut endpoint,
            &self.settings.readiness,
            self.cancel,
            move |host: String| async move { boot_marker_present(remote, &host).await },
        )
        .await;
        run.endpoint = Some(endpoint.clone());
        waited?;
        self.reporter.success(&format!("{} is ready", endpoint.address));

        // ── Converging ──
        self.heartbeat(lock).await?;
        self.advance(run, RunStage::Converging)?;
        self.reporter.step(&format!(
            "converging container {}...",
            manifest.workload.container_name
        ));
        let agent = ConvergenceAgent::new(
            self.remote,
            self.settings.connect_retry,
            self.settings.container_poll,
            self.cancel,
        );
        let outcome = agent
            .converge(
                &endpoint,
                &manifest.workload,
                request.registry_password.as_deref(),
            )
            .await?;
        self.reporter.success(&format!(
            "container {} {}",
            manifest.workload.container_name,
            outcome.action.as_str()
        ));

        // ── Verifying ──
        self.heartbeat(lock).await?;
        self.advance(run, RunStage::Verifying)?;
        let result = verify(
            self.prober,
            &endpoint,
            manifest.workload.published_port,
            &manifest.effective_probes(),
            &self.settings.probes,
            self.cancel,
        )
        .await?;
        run.verification = Some(result.clone());
        if let Some(failed) = result.first_failure() {
            return Err(DeployError::VerificationFailed(format!(
                "{} {}: {}",
                failed.probe.method.as_str(),
                failed.probe.path,
                failed.error.as_deref().unwrap_or("no response")
            ))
            .into());
        }
        if !result.passed {
            return Err(DeployError::VerificationFailed("no probes were run".to_string()).into());
        }
        self.reporter.success("verification passed");

        self.advance(run, RunStage::Done)
    }

    /// Apply `changes` and persist the outcome, partial or not.
    async fn provision(
        &self,
        run: &mut DeploymentRun,
        target: &str,
        changes: &ChangeSet,
        current: &StateSnapshot,
    ) -> Result<StateSnapshot> {
        if changes.is_empty() && !current.partial {
            self.reporter.success("infrastructure up to date");
            return Ok(current.clone());
        }
        self.reporter
            .step(&format!("applying {} change(s)...", changes.summary().len()));

        let provisioner = Provisioner::new(
            self.provider,
            self.settings.provider_retry,
            self.settings.instance_poll,
            self.cancel,
        );
        match provisioner.apply(target, changes, &current.resources).await {
            Ok(resources) => {
                let saved = self.persist(target, current, resources, false).await?;
                run.snapshot = Some(saved.clone());
                self.reporter.success(&format!(
                    "infrastructure applied (generation {})",
                    saved.generation
                ));
                Ok(saved)
            }
            Err(failure) => {
                match self.persist(target, current, failure.partial, true).await {
                    Ok(saved) => run.snapshot = Some(saved),
                    Err(e) => {
                        tracing::error!(target_key = target, error = %e, "cannot persist partial state");
                    }
                }
                Err(failure.error)
            }
        }
    }

    async fn persist(
        &self,
        target: &str,
        current: &StateSnapshot,
        resources: ProvisionedResources,
        partial: bool,
    ) -> Result<StateSnapshot> {
        let snapshot = StateSnapshot {
            target_key: target.to_string(),
            generation: current.generation + 1,
            written_at: Utc::now(),
            partial,
            resources,
        };
        self.store
            .write_state(target, &snapshot, current.generation)
            .await
    }

    async fn release(&self, lock: &Lock) -> bool {
        match self.store.release_lock(lock).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(target_key = %lock.target_key, "lock was no longer ours to release");
                false
            }
            Err(e) => {
                tracing::error!(target_key = %lock.target_key, error = %e, "lock release failed");
                self.reporter
                    .warn(&format!("could not release lock on {}: {e}", lock.target_key));
                false
            }
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    /// Renew the lock before a long stage; a lost lock ends the run.
    async fn heartbeat(&self, lock: &mut Lock) -> Result<()> {
        *lock = self.store.refresh_lock(lock).await?;
        tracing::debug!(target_key = %lock.target_key, "lock refreshed");
        Ok(())
    }

    fn advance(&self, run: &mut DeploymentRun, to: RunStage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DeployError::Cancelled.into());
        }
        run.advance(to, Utc::now())?;
        tracing::debug!(run_id = %run.run_id, stage = %to, "stage entered");
        Ok(())
    }

    fn fail(&self, run: &mut DeploymentRun, err: &anyhow::Error) {
        let code = error_code(err);
        let message = format!("{err:#}");
        tracing::warn!(run_id = %run.run_id, stage = %run.stage(), code, error = %message, "run failed");
        self.reporter.warn(&message);
        run.fail(code, &message, Utc::now());
    }

    fn report_plan(&self, changes: &ChangeSet) {
        let summary = changes.summary();
        if summary.is_empty() {
            self.reporter.success("no infrastructure changes");
            return;
        }
        for (kind, action) in summary {
            tracing::info!(resource = %kind, action = action.as_str(), "planned change");
        }
    }
}

fn creates_instance(changes: &ChangeSet) -> bool {
    changes
        .operations
        .iter()
        .any(|op| op.resource_kind == ResourceKind::Instance && op.action == Action::Create)
}
