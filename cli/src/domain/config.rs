//! Domain types and validators for keel configuration.
//!
//! Pure functions only: no I/O, no async, no filesystem access.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use keel_common::{defaults, validate_actor, validate_target_key};
use serde::{Deserialize, Serialize};

use crate::domain::error::ConfigError;
use crate::domain::retry::{PollPolicy, RetryPolicy};
use crate::domain::verify::ProbePolicy;

// ── Constants ────────────────────────────────────────────────────────────────

pub const VALID_CONFIG_KEYS: &[&str] = &[
    "provider.region",
    "provider.profile",
    "ssh.user",
    "ssh.private_key",
    "state.database",
    "lock.ttl_secs",
    "lock.wait_secs",
    "readiness.interval_secs",
    "readiness.timeout_secs",
    "retry.base_secs",
    "retry.cap_secs",
    "retry.max_attempts",
    "verify.timeout_secs",
    "verify.attempts",
    "verify.retry_delay_secs",
    "approval.timeout_secs",
    "approval.poll_secs",
    "approval.approvers.<target>",
];

const APPROVERS_PREFIX: &str = "approval.approvers.";

// ── Config schema ────────────────────────────────────────────────────────────

/// Top-level configuration stored in `~/.keel/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct KeelConfig {
    pub provider: ProviderConfig,
    pub ssh: SshConfig,
    pub state: StateConfig,
    pub lock: LockConfig,
    pub readiness: ReadinessConfig,
    pub retry: RetryConfig,
    pub verify: VerifyConfig,
    pub approval: ApprovalConfig,
}

/// Provider CLI settings. `None` defers to the AWS CLI's own resolution.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// Remote execution channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SshConfig {
    /// Login user on the instance image.
    pub user: String,
    /// Private key matching the manifest's credential pair.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            private_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct StateConfig {
    /// SQLite database path. Defaults to `~/.keel/state.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_secs: u64,
    /// How long to keep retrying a held lock. `0` fails immediately.
    pub wait_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: defaults::LOCK_TTL_SECS,
            wait_secs: defaults::LOCK_WAIT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReadinessConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::READINESS_INTERVAL_SECS,
            timeout_secs: defaults::READINESS_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_secs: u64,
    pub cap_secs: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_secs: defaults::PROVIDER_RETRY_BASE_SECS,
            cap_secs: defaults::PROVIDER_RETRY_CAP_SECS,
            max_attempts: defaults::PROVIDER_RETRY_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    pub timeout_secs: u64,
    pub attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::PROBE_TIMEOUT_SECS,
            attempts: defaults::PROBE_ATTEMPTS,
            retry_delay_secs: defaults::PROBE_RETRY_DELAY_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApprovalConfig {
    pub timeout_secs: u64,
    pub poll_secs: u64,
    /// Targets that require approval, mapped to who may approve them.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub approvers: BTreeMap<String, Vec<String>>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::APPROVAL_TIMEOUT_SECS,
            poll_secs: defaults::APPROVAL_POLL_SECS,
            approvers: BTreeMap::new(),
        }
    }
}

impl KeelConfig {
    /// Approvers configured for `target`; empty means no approval gate.
    #[must_use]
    pub fn approvers_for(&self, target: &str) -> &[String] {
        self.approval
            .approvers
            .get(target)
            .map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn provider_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.retry.base_secs),
            Duration::from_secs(self.retry.cap_secs),
            self.retry.max_attempts,
        )
    }

    #[must_use]
    pub fn readiness_poll(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.readiness.interval_secs),
            Duration::from_secs(self.readiness.timeout_secs),
        )
    }

    #[must_use]
    pub fn approval_poll(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.approval.poll_secs),
            Duration::from_secs(self.approval.timeout_secs),
        )
    }

    #[must_use]
    pub fn instance_poll(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(defaults::INSTANCE_POLL_SECS),
            Duration::from_secs(defaults::INSTANCE_RUNNING_TIMEOUT_SECS),
        )
    }

    /// Backoff for the remote channel while the instance is still booting.
    #[must_use]
    pub fn connect_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(defaults::CONNECT_RETRY_BASE_SECS),
            Duration::from_secs(defaults::CONNECT_RETRY_CAP_SECS),
            defaults::CONNECT_ATTEMPTS,
        )
    }

    #[must_use]
    pub fn container_poll(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(defaults::CONTAINER_POLL_SECS),
            Duration::from_secs(defaults::CONTAINER_RUNNING_TIMEOUT_SECS),
        )
    }

    #[must_use]
    pub fn probe_policy(&self) -> ProbePolicy {
        ProbePolicy {
            timeout: Duration::from_secs(self.verify.timeout_secs),
            attempts: self.verify.attempts.max(1),
            retry_delay: Duration::from_secs(self.verify.retry_delay_secs),
        }
    }

    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock.ttl_secs)
    }

    #[must_use]
    pub fn lock_wait(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(defaults::LOCK_RETRY_SECS),
            Duration::from_secs(self.lock.wait_secs),
        )
    }

    /// Flattened `key: value` view for `keel config show`.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, String)> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_else(|| "(not set)".to_string());
        let mut out = vec![
            ("provider.region".to_string(), opt(&self.provider.region)),
            ("provider.profile".to_string(), opt(&self.provider.profile)),
            ("ssh.user".to_string(), self.ssh.user.clone()),
            ("ssh.private_key".to_string(), opt(&self.ssh.private_key)),
            ("state.database".to_string(), opt(&self.state.database)),
            ("lock.ttl_secs".to_string(), self.lock.ttl_secs.to_string()),
            ("lock.wait_secs".to_string(), self.lock.wait_secs.to_string()),
            (
                "readiness.interval_secs".to_string(),
                self.readiness.interval_secs.to_string(),
            ),
            (
                "readiness.timeout_secs".to_string(),
                self.readiness.timeout_secs.to_string(),
            ),
            ("retry.base_secs".to_string(), self.retry.base_secs.to_string()),
            ("retry.cap_secs".to_string(), self.retry.cap_secs.to_string()),
            (
                "retry.max_attempts".to_string(),
                self.retry.max_attempts.to_string(),
            ),
            (
                "verify.timeout_secs".to_string(),
                self.verify.timeout_secs.to_string(),
            ),
            ("verify.attempts".to_string(), self.verify.attempts.to_string()),
            (
                "verify.retry_delay_secs".to_string(),
                self.verify.retry_delay_secs.to_string(),
            ),
            (
                "approval.timeout_secs".to_string(),
                self.approval.timeout_secs.to_string(),
            ),
            (
                "approval.poll_secs".to_string(),
                self.approval.poll_secs.to_string(),
            ),
        ];
        for (target, actors) in &self.approval.approvers {
            out.push((format!("{APPROVERS_PREFIX}{target}"), actors.join(",")));
        }
        out
    }
}

// ── Validators ───────────────────────────────────────────────────────────────

/// Validates a configuration key against the whitelist.
///
/// # Errors
///
/// Returns an error if the key is not in the allowed list.
pub fn validate_config_key(key: &str) -> Result<()> {
    if let Some(target) = key.strip_prefix(APPROVERS_PREFIX) {
        if validate_target_key(target).is_ok() {
            return Ok(());
        }
    } else if VALID_CONFIG_KEYS.contains(&key) {
        return Ok(());
    }
    Err(ConfigError::UnknownKey {
        key: key.to_string(),
        valid: VALID_CONFIG_KEYS.join(", "),
    }
    .into())
}

/// Validates a configuration value for the given key.
///
/// # Errors
///
/// Returns an error if the value is not valid for the key.
pub fn validate_config_value(key: &str, value: &str) -> Result<()> {
    let invalid = |valid: &str| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        valid: valid.to_string(),
    };
    if key.starts_with(APPROVERS_PREFIX) {
        let bad = value
            .split(',')
            .filter(|a| !a.is_empty())
            .any(|a| validate_actor(a.trim()).is_err());
        if bad {
            return Err(invalid("comma-separated actors of [A-Za-z0-9._@-], empty to clear").into());
        }
        return Ok(());
    }
    match key {
        "lock.wait_secs" => {
            value.parse::<u64>().map_err(|_| invalid("a whole number of seconds"))?;
        }
        "lock.ttl_secs"
        | "readiness.interval_secs"
        | "readiness.timeout_secs"
        | "retry.base_secs"
        | "retry.cap_secs"
        | "verify.timeout_secs"
        | "verify.retry_delay_secs"
        | "approval.timeout_secs"
        | "approval.poll_secs" => match value.parse::<u64>() {
            Ok(n) if n > 0 => {}
            _ => return Err(invalid("a positive whole number of seconds").into()),
        },
        "retry.max_attempts" | "verify.attempts" => match value.parse::<u32>() {
            Ok(n) if n > 0 => {}
            _ => return Err(invalid("a positive whole number").into()),
        },
        "ssh.user" => {
            if value.is_empty() || value.contains(char::is_whitespace) {
                return Err(invalid("a non-empty user name without spaces").into());
            }
        }
        _ => {}
    }
    Ok(())
}

/// Apply a validated `key = value` to `config`.
///
/// # Errors
///
/// Returns an error if the key or value is invalid.
pub fn apply_config_value(config: &mut KeelConfig, key: &str, value: &str) -> Result<()> {
    validate_config_key(key)?;
    validate_config_value(key, value)?;

    let secs = || value.parse::<u64>().unwrap_or_default();
    let count = || value.parse::<u32>().unwrap_or_default();
    let opt = || (!value.is_empty()).then(|| value.to_string());

    if let Some(target) = key.strip_prefix(APPROVERS_PREFIX) {
        let actors: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        if actors.is_empty() {
            config.approval.approvers.remove(target);
        } else {
            config.approval.approvers.insert(target.to_string(), actors);
        }
        return Ok(());
    }

    match key {
        "provider.region" => config.provider.region = opt(),
        "provider.profile" => config.provider.profile = opt(),
        "ssh.user" => config.ssh.user = value.to_string(),
        "ssh.private_key" => config.ssh.private_key = opt(),
        "state.database" => config.state.database = opt(),
        "lock.ttl_secs" => config.lock.ttl_secs = secs(),
        "lock.wait_secs" => config.lock.wait_secs = secs(),
        "readiness.interval_secs" => config.readiness.interval_secs = secs(),
        "readiness.timeout_secs" => config.readiness.timeout_secs = secs(),
        "retry.base_secs" => config.retry.base_secs = secs(),
        "retry.cap_secs" => config.retry.cap_secs = secs(),
        "retry.max_attempts" => config.retry.max_attempts = count(),
        "verify.timeout_secs" => config.verify.timeout_secs = secs(),
        "verify.attempts" => config.verify.attempts = count(),
        "verify.retry_delay_secs" => config.verify.retry_delay_secs = secs(),
        "approval.timeout_secs" => config.approval.timeout_secs = secs(),
        "approval.poll_secs" => config.approval.poll_secs = secs(),
        _ => anyhow::bail!("Unknown setting: {key}"),
    }
    Ok(())
}

// ── Unit tests ───────────────────────────────────────────────────────────────
