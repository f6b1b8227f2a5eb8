//! Identifier formats, provider tag names and default timings shared by
//! every keel component.

use thiserror::Error;

/// Provider tag that binds a cloud resource to its deployment target.
/// Format: `keel:target=<target_key>`
pub const TARGET_TAG: &str = "keel:target";

/// Validation failures for identifiers built from untrusted input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid target key '{0}': must match ^[a-z0-9][a-z0-9-]{{0,62}}$")]
    InvalidTarget(String),

    #[error("invalid run id '{0}': expected run- followed by 16 lowercase hex characters")]
    InvalidRunId(String),

    #[error("invalid actor '{0}': 1-64 characters of [A-Za-z0-9._@-]")]
    InvalidActor(String),
}

/// Default timings and budgets. Every value can be overridden in
/// `~/.keel/config.yaml`.
pub mod defaults {
    /// Lock lifetime before it is considered abandoned (30 minutes).
    pub const LOCK_TTL_SECS: u64 = 1800;
    /// How long a run keeps retrying a held lock before giving up.
    pub const LOCK_WAIT_SECS: u64 = 0;
    /// Delay between acquisition attempts while waiting for a held lock.
    pub const LOCK_RETRY_SECS: u64 = 5;

    /// Boot-completion poll interval.
    pub const READINESS_INTERVAL_SECS: u64 = 10;
    /// Boot-completion deadline (5 minutes).
    pub const READINESS_TIMEOUT_SECS: u64 = 300;

    /// Provider transient-error backoff: base, cap and attempt budget.
    pub const PROVIDER_RETRY_BASE_SECS: u64 = 2;
    pub const PROVIDER_RETRY_CAP_SECS: u64 = 60;
    pub const PROVIDER_RETRY_ATTEMPTS: u32 = 6;

    /// Wait for a freshly created instance to report `running`.
    pub const INSTANCE_POLL_SECS: u64 = 5;
    pub const INSTANCE_RUNNING_TIMEOUT_SECS: u64 = 300;

    /// Remote channel connection attempts during the post-boot window.
    pub const CONNECT_ATTEMPTS: u32 = 5;
    pub const CONNECT_RETRY_BASE_SECS: u64 = 3;
    pub const CONNECT_RETRY_CAP_SECS: u64 = 30;

    /// Wait for a started container to report `running`.
    pub const CONTAINER_POLL_SECS: u64 = 2;
    pub const CONTAINER_RUNNING_TIMEOUT_SECS: u64 = 60;

    /// Per-probe request timeout, attempts and delay between attempts.
    pub const PROBE_TIMEOUT_SECS: u64 = 5;
    pub const PROBE_ATTEMPTS: u32 = 3;
    pub const PROBE_RETRY_DELAY_SECS: u64 = 2;

    /// Approval wait deadline (1 hour) and decision poll interval.
    pub const APPROVAL_TIMEOUT_SECS: u64 = 3600;
    pub const APPROVAL_POLL_SECS: u64 = 15;
}

/// Validate a target key before it is used in provider names, tags or
/// store keys.
pub fn validate_target_key(target: &str) -> Result<(), KeyError> {
    let invalid = || KeyError::InvalidTarget(target.to_string());
    let mut chars = target.chars();
    let first = chars.next().ok_or_else(invalid)?;
    if target.len() > 63 || !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return Err(invalid());
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return Err(invalid());
    }
    Ok(())
}

/// Validate a run id: `run-` followed by 16 lowercase hex characters.
pub fn validate_run_id(run_id: &str) -> Result<(), KeyError> {
    let suffix = run_id
        .strip_prefix("run-")
        .ok_or_else(|| KeyError::InvalidRunId(run_id.to_string()))?;
    if suffix.len() != 16
        || !suffix
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(KeyError::InvalidRunId(run_id.to_string()));
    }
    Ok(())
}

/// Validate an actor identity as recorded on approval decisions.
pub fn validate_actor(actor: &str) -> Result<(), KeyError> {
    let ok = !actor.is_empty()
        && actor.len() <= 64
        && actor
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-'));
    if ok {
        Ok(())
    } else {
        Err(KeyError::InvalidActor(actor.to_string()))
    }
}

/// Security-group name owned by a target.
#[must_use]
pub fn policy_name(target: &str) -> String {
    format!("keel-{target}")
}

/// `Name` tag of the instance owned by a target.
#[must_use]
pub fn instance_name(target: &str) -> String {
    format!("keel-{target}")
}
