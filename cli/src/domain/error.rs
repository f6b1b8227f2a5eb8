//! Typed domain error enums.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All error types implement `thiserror::Error` and convert to `anyhow::Error`
//! via the `?` operator.

use chrono::{DateTime, Utc};
use keel_common::{ResourceKind, RunStage};
use thiserror::Error;

// ── Deployment errors ─────────────────────────────────────────────────────────

/// Failures that end a deployment run. Every variant has a stable
/// machine-readable code (see [`DeployError::code`]).
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("target '{target}' is locked by {holder} until {expires_at}")]
    LockHeld {
        target: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("lock on target '{target}' is no longer held by {holder}")]
    LockLost { target: String, holder: String },

    #[error(
        "state of target '{target}' changed concurrently (expected generation {expected}, found {found})"
    )]
    VersionConflict {
        target: String,
        expected: u64,
        found: u64,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("no endpoint found for target '{target}': {reason}")]
    NotFound { target: String, reason: String },

    #[error("{what} did not complete within {secs}s")]
    Timeout { what: String, secs: u64 },

    #[error("approval for run {run_id} timed out after {secs}s")]
    ApprovalTimeout { run_id: String, secs: u64 },

    #[error("run {run_id} was rejected by {actor}")]
    ApprovalRejected { run_id: String, actor: String },

    #[error("cannot connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("container convergence failed: {0}")]
    Convergence(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("run cancelled")]
    Cancelled,
}

impl DeployError {
    /// Stable error code used in run reports and `--json` error objects.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::LockHeld { .. } => "lock_held",
            Self::LockLost { .. } => "lock_lost",
            Self::VersionConflict { .. } => "version_conflict",
            Self::Provider(ProviderError::Transient(_)) => "provider_transient",
            Self::Provider(_) => "provider_terminal",
            Self::NotFound { .. } => "not_found",
            Self::Timeout { .. } => "timeout",
            Self::ApprovalTimeout { .. } => "approval_timeout",
            Self::ApprovalRejected { .. } => "approval_rejected",
            Self::Connect { .. } => "connect_error",
            Self::Convergence(_) => "convergence_error",
            Self::VerificationFailed(_) => "verification_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Classify an arbitrary error chain into a stable code.
///
/// Errors that did not originate from a [`DeployError`] map to `internal`.
#[must_use]
pub fn error_code(err: &anyhow::Error) -> &'static str {
    if let Some(e) = err.downcast_ref::<DeployError>() {
        return e.code();
    }
    if let Some(e) = err.downcast_ref::<ProviderError>() {
        return DeployError::code(&DeployError::Provider(e.clone()));
    }
    "internal"
}

// ── Provider errors ───────────────────────────────────────────────────────────

/// Errors surfaced by the cloud provider adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Throttling or eventual-consistency lag; safe to retry.
    #[error("provider temporarily unavailable: {0}")]
    Transient(String),

    /// Invalid parameters, quota, permissions. Never retried.
    #[error("provider rejected the request: {0}")]
    Terminal(String),

    /// The referenced resource does not exist (anymore).
    #[error("{kind} '{id}' not found at provider")]
    NotFound { kind: ResourceKind, id: String },
}

impl ProviderError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ── Run lifecycle errors ──────────────────────────────────────────────────────

/// A run stage change that would move backwards or leave a terminal stage.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid run transition {from} -> {to}")]
pub struct TransitionError {
    pub from: RunStage,
    pub to: RunStage,
}

// ── Planner errors ────────────────────────────────────────────────────────────

/// The resource dependency graph contains a cycle.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("dependency cycle between: {}", .0.join(", "))]
pub struct CycleError(pub Vec<String>);

// ── Manifest errors ───────────────────────────────────────────────────────────

/// Errors related to deployment manifest parsing and validation.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Cannot parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    InvalidKey(#[from] keel_common::KeyError),

    #[error("Invalid manifest field {field}: {reason}")]
    Invalid { field: String, reason: String },
}

// ── Config errors ─────────────────────────────────────────────────────────────

/// Errors related to configuration key/value validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown setting: {key}\n\nValid settings: {valid}")]
    UnknownKey { key: String, valid: String },

    #[error("Invalid value for {key}: {value}\n\nValid values: {valid}")]
    InvalidValue {
        key: String,
        value: String,
        valid: String,
    },
}
