use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

// ── Declared topology ─────────────────────────────────────────────────────────

/// Transport protocol of an ingress rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// One inbound allowance on the network policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IngressRule {
    pub protocol: Protocol,
    pub port: u16,
    /// Source range in CIDR notation, e.g. `0.0.0.0/0`.
    pub source: String,
}

/// Reference to an SSH key pair registered with the provider.
///
/// Only the public half is referenced; the private key stays out-of-band.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialRef {
    /// Provider-side key pair name.
    pub name: String,
    /// Local path of the public key imported into the provider.
    pub public_key_path: String,
}

/// Desired infrastructure for one target. Supplied per run, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeclaredTopology {
    /// Provider instance class, e.g. `t3.micro`.
    pub instance_class: String,
    /// Machine image the instance boots from.
    pub image_id: String,
    /// Inbound rules of the network policy.
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
    /// Key pair installed on the instance for the remote execution channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_credential: Option<CredentialRef>,
    /// Cloud-init user data. `None` selects the built-in bootstrap script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<String>,
}

// ── Provisioned resources ─────────────────────────────────────────────────────

/// The resource kinds this engine manages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    CredentialPair,
    NetworkPolicy,
    Instance,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::CredentialPair,
        ResourceKind::NetworkPolicy,
        ResourceKind::Instance,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CredentialPair => "credential-pair",
            Self::NetworkPolicy => "network-policy",
            Self::Instance => "instance",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialPairRecord {
    pub name: String,
    pub public_key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkPolicyRecord {
    /// Provider-assigned security-group id.
    pub id: String,
    pub name: String,
    pub ingress: Vec<IngressRule>,
}

/// Provider lifecycle state of a compute instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLifecycle {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Unknown,
}

impl InstanceLifecycle {
    /// Parse the provider's state name (`running`, `shutting-down`, ...).
    #[must_use]
    pub fn from_provider(state: &str) -> Self {
        match state {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            _ => Self::Unknown,
        }
    }

    /// `true` once the instance is going away for good.
    #[must_use]
    pub fn is_terminated(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    /// Provider-assigned instance id.
    pub id: String,
    pub name: String,
    pub class: String,
    pub image_id: String,
    /// SHA-256 of the user data the instance booted with.
    pub bootstrap_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    /// Public IPv4 address, once assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub lifecycle: InstanceLifecycle,
}

/// Everything the provider created for a target.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionedResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_pair: Option<CredentialPairRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<NetworkPolicyRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceRecord>,
}

impl ProvisionedResources {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credential_pair.is_none() && self.network_policy.is_none() && self.instance.is_none()
    }

    /// Provider id of the recorded resource of `kind`, if any.
    #[must_use]
    pub fn id_of(&self, kind: ResourceKind) -> Option<&str> {
        match kind {
            ResourceKind::CredentialPair => self.credential_pair.as_ref().map(|c| c.name.as_str()),
            ResourceKind::NetworkPolicy => self.network_policy.as_ref().map(|p| p.id.as_str()),
            ResourceKind::Instance => self.instance.as_ref().map(|i| i.id.as_str()),
        }
    }
}

/// Last-applied infrastructure of a target. Each convergence writes a new
/// generation; stored generations are never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSnapshot {
    pub target_key: String,
    /// Monotonic version. `0` means nothing has ever been written.
    pub generation: u64,
    pub written_at: DateTime<Utc>,
    /// Written after an apply that failed part-way.
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub resources: ProvisionedResources,
}

impl StateSnapshot {
    /// The snapshot of a target that has never been converged.
    #[must_use]
    pub fn empty(target_key: &str) -> Self {
        Self {
            target_key: target_key.to_string(),
            generation: 0,
            written_at: DateTime::default(),
            partial: false,
            resources: ProvisionedResources::default(),
        }
    }
}

// ── Lock ──────────────────────────────────────────────────────────────────────

/// Mutual-exclusion record for one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lock {
    pub target_key: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl Lock {
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = i64::try_from(self.ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        self.acquired_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// A lock whose TTL has elapsed is treated as released.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

// ── Workload ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    #[default]
    Always,
    UnlessStopped,
    OnFailure,
}

impl RestartPolicy {
    /// Value for `docker run --restart`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
            Self::UnlessStopped => "unless-stopped",
            Self::OnFailure => "on-failure",
        }
    }
}

/// Registry login for authenticated pulls. The password itself is read
/// from `password_env` at run time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub registry: String,
    pub username: String,
    pub password_env: String,
}

/// Desired container on the endpoint. Supplied per run, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadDescriptor {
    #[serde(alias = "image")]
    pub image_reference: String,
    pub container_name: String,
    /// Host port exposed on the instance.
    pub published_port: u16,
    /// Port the service listens on inside the container. Defaults to
    /// `published_port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_credentials: Option<RegistryCredentials>,
}

impl WorkloadDescriptor {
    #[must_use]
    pub fn target_port(&self) -> u16 {
        self.container_port.unwrap_or(self.published_port)
    }
}

// ── Endpoint & verification ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    #[default]
    Unknown,
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub readiness: Readiness,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
    Post,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
        }
    }
}

fn default_expect_status() -> u16 {
    200
}

/// Synthetic request against the deployed workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Probe {
    #[serde(default)]
    pub method: HttpMethod,
    pub path: String,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_contains: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeResult {
    pub probe: Probe,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub latency_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationResult {
    pub passed: bool,
    pub probes: Vec<ProbeResult>,
}

impl VerificationResult {
    /// The first probe that did not pass, kept for diagnostics.
    #[must_use]
    pub fn first_failure(&self) -> Option<&ProbeResult> {
        self.probes.iter().find(|p| !p.passed)
    }
}

// ── Approval ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approved,
    Rejected,
}

impl Verdict {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

/// Suspend point of a run awaiting a human decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub run_id: String,
    pub target_key: String,
    pub initiator: String,
    pub required_approvers: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub run_id: String,
    pub actor: String,
    pub verdict: Verdict,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

// ── Change-set ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Destroy,
    Noop,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::Noop => "noop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceParams {
    pub name: String,
    pub class: String,
    pub image_id: String,
    pub bootstrap: String,
    pub bootstrap_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
}

/// Parameters an operation needs from the declared side, or the provider
/// id of the existing resource for destroys and no-ops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "params", rename_all = "snake_case")]
pub enum ResourceParams {
    CredentialPair(CredentialRef),
    NetworkPolicy {
        name: String,
        ingress: Vec<IngressRule>,
    },
    Instance(InstanceParams),
    Existing {
        id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeOp {
    pub resource_kind: ResourceKind,
    pub action: Action,
    #[serde(flatten)]
    pub params: ResourceParams,
}

/// Ordered operations that bring a target from its snapshot to the
/// declared topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeSet {
    pub operations: Vec<ChangeOp>,
}

impl ChangeSet {
    /// Operations that change provider state.
    pub fn mutations(&self) -> impl Iterator<Item = &ChangeOp> {
        self.operations.iter().filter(|op| op.action != Action::Noop)
    }

    /// `true` when applying would not touch the provider.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations().next().is_none()
    }

    /// `(kind, action)` pairs of the mutating operations, in apply order.
    #[must_use]
    pub fn summary(&self) -> Vec<(ResourceKind, Action)> {
        self.mutations()
            .map(|op| (op.resource_kind, op.action))
            .collect()
    }
}

// ── Run lifecycle ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    /// Plan only; never mutates and never waits for approval.
    Preview,
    Deploy,
    Destroy,
}

impl RunKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preview => "preview",
            Self::Deploy => "deploy",
            Self::Destroy => "destroy",
        }
    }

    #[must_use]
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Preview)
    }
}

/// Orchestrator states, in forward order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Init,
    Locking,
    Planning,
    AwaitingApproval,
    Provisioning,
    Discovering,
    WaitingReady,
    Converging,
    Verifying,
    Done,
    Failed,
    Released,
}

impl RunStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Locking => "locking",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Provisioning => "provisioning",
            Self::Discovering => "discovering",
            Self::WaitingReady => "waiting_ready",
            Self::Converging => "converging",
            Self::Verifying => "verifying",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Released => "released",
        }
    }

    /// `done` or `failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageTransition {
    pub from: RunStage,
    pub to: RunStage,
    pub at: DateTime<Utc>,
}

/// Where and why a run failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureDetail {
    pub stage: RunStage,
    /// Stable error code, e.g. `lock_held` or `verification_failed`.
    pub code: String,
    pub message: String,
}

/// Terminal artifact of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub target_key: String,
    pub kind: RunKind,
    pub final_state: RunStage,
    pub stages: Vec<StageTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_set: Option<ChangeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<StateSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    pub lock_released: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.final_state == RunStage::Done
    }
}
