//! Application service: per-target status view.

use anyhow::Result;
use chrono::{DateTime, Utc};
use keel_common::{Lock, RunReport, StateSnapshot, validate_target_key};
use serde::Serialize;

use crate::application::ports::{LockManager, RunJournal, StateStore};

/// Number of journalled runs shown by `keel status`.
pub const RECENT_RUNS: usize = 5;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LockStatus {
    #[serde(flatten)]
    pub lock: Lock,
    pub expires_at: DateTime<Utc>,
    /// An expired lock is replaced by the next acquirer.
    pub expired: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TargetStatus {
    pub target: String,
    pub snapshot: Option<StateSnapshot>,
    pub lock: Option<LockStatus>,
    pub recent_runs: Vec<RunReport>,
}

/// Gather the stored snapshot, lock and recent runs of `target`.
///
/// # Errors
///
/// Returns an error if the target key is invalid or the store cannot be read.
pub async fn target_status(
    store: &(impl StateStore + LockManager + RunJournal),
    target: &str,
) -> Result<TargetStatus> {
    validate_target_key(target)?;
    let snapshot = store.read_state(target).await?;
    let now = Utc::now();
    let lock = store.current_lock(target).await?.map(|lock| LockStatus {
        expires_at: lock.expires_at(),
        expired: lock.is_expired_at(now),
        lock,
    });
    let recent_runs = store.recent_runs(target, RECENT_RUNS).await?;
    Ok(TargetStatus {
        target: target.to_string(),
        snapshot,
        lock,
        recent_runs,
    })
}
