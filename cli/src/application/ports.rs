//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces (contracts) that infrastructure must fulfill.
//! This file imports only from `crate::domain` and `keel_common`; never
//! from `crate::infra`, `crate::commands`, or `crate::output`.

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use anyhow::Result;
use keel_common::{
    ApprovalDecision, ApprovalRequest, CredentialPairRecord, CredentialRef, HttpMethod,
    IngressRule, InstanceParams, InstanceRecord, Lock, NetworkPolicyRecord, RunReport,
    StateSnapshot,
};

use crate::domain::config::KeelConfig;
use crate::domain::error::ProviderError;
use crate::domain::verify::ProbeResponse;

// ── Command Runner Port ───────────────────────────────────────────────────────

/// Abstracts process execution so infrastructure can be swapped or mocked.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Run a program and capture its output.
    ///
    /// Implementations should delegate to `run_with_timeout` using the
    /// instance's configured default timeout.
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output>;
    /// Run a program with a custom timeout override.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or exceeds `timeout`.
    /// On timeout, the child process must be killed (not left orphaned).
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output>;
    /// Run a program with stdin piped from `stdin`.
    async fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &[u8]) -> Result<Output>;
}

// ── State Store & Lock Manager ────────────────────────────────────────────────

/// Versioned, append-only store of applied infrastructure per target.
#[allow(async_fn_in_trait)]
pub trait StateStore {
    /// Latest snapshot of `target`, or `None` if nothing was ever written.
    async fn read_state(&self, target: &str) -> Result<Option<StateSnapshot>>;

    /// Store `snapshot` as generation `expected_version + 1`.
    ///
    /// # Errors
    ///
    /// Fails with `DeployError::VersionConflict` when the stored generation
    /// is not `expected_version` (`0` meaning none).
    async fn write_state(
        &self,
        target: &str,
        snapshot: &StateSnapshot,
        expected_version: u64,
    ) -> Result<StateSnapshot>;
}

/// Per-target mutual exclusion with TTL-based self-healing.
#[allow(async_fn_in_trait)]
pub trait LockManager {
    /// Non-blocking acquire. An expired lock is replaced.
    ///
    /// # Errors
    ///
    /// Fails with `DeployError::LockHeld` while another holder's lock is valid.
    async fn acquire_lock(&self, target: &str, holder: &str, ttl: Duration) -> Result<Lock>;
    /// Delete the lock if it is still held by `lock.holder_id`.
    /// Returns `false` when there was nothing of ours to delete.
    async fn release_lock(&self, lock: &Lock) -> Result<bool>;
    /// Restart the TTL of a lock still held by the caller.
    ///
    /// # Errors
    ///
    /// Fails with `DeployError::LockLost` if another holder took over.
    async fn refresh_lock(&self, lock: &Lock) -> Result<Lock>;
    /// The stored lock record, expired or not.
    async fn current_lock(&self, target: &str) -> Result<Option<Lock>>;
    /// Remove any lock on `target` regardless of holder.
    async fn force_release(&self, target: &str) -> Result<bool>;
}

// ── Approval & Journal Ports ──────────────────────────────────────────────────

/// Persisted approval requests and the decisions recorded against them.
#[allow(async_fn_in_trait)]
pub trait ApprovalChannel {
    /// Persist `request`, or return the one already stored for its run id.
    async fn open_request(&self, request: &ApprovalRequest) -> Result<ApprovalRequest>;
    async fn request(&self, run_id: &str) -> Result<Option<ApprovalRequest>>;
    /// Decisions for `run_id` in the order they were recorded.
    async fn decisions(&self, run_id: &str) -> Result<Vec<ApprovalDecision>>;
    /// Returns `false` if the actor already decided on this run.
    async fn record_decision(&self, decision: &ApprovalDecision) -> Result<bool>;
}

/// Append-only log of terminal run reports.
#[allow(async_fn_in_trait)]
pub trait RunJournal {
    async fn record_run(&self, report: &RunReport) -> Result<()>;
    /// Most recent first.
    async fn recent_runs(&self, target: &str, limit: usize) -> Result<Vec<RunReport>>;
}

// ── Cloud Provider Port ───────────────────────────────────────────────────────

/// The provider operations the provisioner and discovery need.
///
/// Every created resource is tagged `keel:target=<target>`.
#[allow(async_fn_in_trait)]
pub trait CloudProvider {
    async fn import_key_pair(
        &self,
        target: &str,
        credential: &CredentialRef,
    ) -> Result<CredentialPairRecord, ProviderError>;
    async fn delete_key_pair(&self, name: &str) -> Result<(), ProviderError>;

    /// Create an empty security group; rules are set with
    /// [`update_security_group`](Self::update_security_group).
    async fn create_security_group(
        &self,
        target: &str,
        name: &str,
    ) -> Result<NetworkPolicyRecord, ProviderError>;
    /// Converge the group's rules to `ingress`.
    async fn update_security_group(
        &self,
        current: &NetworkPolicyRecord,
        ingress: &[IngressRule],
    ) -> Result<NetworkPolicyRecord, ProviderError>;
    async fn delete_security_group(&self, id: &str) -> Result<(), ProviderError>;

    async fn run_instance(
        &self,
        target: &str,
        params: &InstanceParams,
        policy_id: Option<&str>,
    ) -> Result<InstanceRecord, ProviderError>;
    async fn describe_instance(&self, id: &str) -> Result<InstanceRecord, ProviderError>;
    async fn terminate_instance(&self, id: &str) -> Result<(), ProviderError>;
    /// All instances tagged with `target`, in any lifecycle state.
    async fn find_instances_by_tag(&self, target: &str)
    -> Result<Vec<InstanceRecord>, ProviderError>;
}

// ── Remote Execution & Probing Ports ──────────────────────────────────────────

/// Runs shell commands on a deployed instance.
#[allow(async_fn_in_trait)]
pub trait RemoteExecutor {
    /// Execute `command` on `host` and capture its output.
    ///
    /// # Errors
    ///
    /// Fails with `DeployError::Connect` when the channel cannot be
    /// established; a command that ran and failed is an `Ok` with a
    /// non-zero status.
    async fn exec(&self, host: &str, command: &str) -> Result<Output>;
    /// Execute `command` on `host` with stdin piped from `input`.
    async fn exec_with_stdin(&self, host: &str, command: &str, input: &[u8]) -> Result<Output>;
    /// Drop any pinned host key for `host` (the address now belongs to a
    /// new instance).
    async fn forget_host(&self, host: &str) -> Result<()>;
}

/// Issues one HTTP request.
#[allow(async_fn_in_trait)]
pub trait HttpProber {
    async fn send(&self, method: HttpMethod, url: &str, timeout: Duration)
    -> Result<ProbeResponse>;
}

// ── Progress Reporting Port ───────────────────────────────────────────────────

/// Abstracts progress reporting so services can emit events without
/// depending on the Presentation layer. Sync trait, no async needed.
pub trait ProgressReporter {
    /// Emit an in-progress step message.
    fn step(&self, message: &str);
    /// Emit a success message.
    fn success(&self, message: &str);
    /// Emit a warning message.
    fn warn(&self, message: &str);
}

// ── Config Port ───────────────────────────────────────────────────────────────

/// Loads and saves `~/.keel/config.yaml`.
pub trait ConfigStore {
    /// Load the config, or defaults when the file does not exist.
    fn load(&self) -> Result<KeelConfig>;
    fn save(&self, config: &KeelConfig) -> Result<()>;
    fn path(&self) -> Result<PathBuf>;
}
