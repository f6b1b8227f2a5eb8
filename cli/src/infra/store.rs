//! SQLite implementation of the state, lock, approval and journal ports.
//!
//! Every call opens its own connection inside `spawn_blocking`, so separate
//! `keel` processes coordinate through the database file alone. Each
//! compare-and-set runs in one `IMMEDIATE` transaction, which takes the
//! write lock before reading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use keel_common::{ApprovalDecision, ApprovalRequest, Lock, RunReport, StateSnapshot};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::application::ports::{ApprovalChannel, LockManager, RunJournal, StateStore};
use crate::domain::error::DeployError;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the schema fails.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let conn = connect(&path)?;
        conn.execute_batch(SCHEMA)
            .with_context(|| format!("cannot initialise {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("cannot set permissions on {}", path.display()))?;
        }
        Ok(Self { path })
    }

    /// `KEEL_STATE_DB`, then the configured path, then `~/.keel/state.db`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn resolve_path(configured: Option<&str>) -> Result<PathBuf> {
        if let Ok(val) = std::env::var("KEEL_STATE_DB") {
            return Ok(PathBuf::from(val));
        }
        if let Some(path) = configured {
            return Ok(PathBuf::from(path));
        }
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        Ok(home.join(".keel").join("state.db"))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = connect(&path)?;
            f(&mut conn)
        })
        .await
        .with_context(|| format!("{what} task panicked"))?
        .with_context(|| format!("cannot {what}"))
    }
}

fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("cannot open state database {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

fn to_sql_int(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn from_sql_int(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn read_lock(conn: &Connection, target: &str) -> Result<Option<Lock>> {
    let row = conn
        .query_row(
            "SELECT holder_id, acquired_at, ttl_secs FROM locks WHERE target_key = ?1",
            params![target],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;
    row.map(|(holder_id, acquired_at, ttl)| {
        Ok(Lock {
            target_key: target.to_string(),
            holder_id,
            acquired_at: parse_ts(&acquired_at)?,
            ttl_secs: from_sql_int(ttl),
        })
    })
    .transpose()
}

fn upsert_lock(conn: &Connection, lock: &Lock) -> Result<()> {
    conn.execute(
        "INSERT INTO locks (target_key, holder_id, acquired_at, ttl_secs) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(target_key) DO UPDATE SET
             holder_id = excluded.holder_id,
             acquired_at = excluded.acquired_at,
             ttl_secs = excluded.ttl_secs",
        params![
            lock.target_key,
            lock.holder_id,
            ts(lock.acquired_at),
            to_sql_int(lock.ttl_secs)
        ],
    )?;
    Ok(())
}

fn same_token(a: &Lock, b: &Lock) -> bool {
    a.holder_id == b.holder_id && ts(a.acquired_at) == ts(b.acquired_at)
}

fn bodies<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(serde_json::from_str(&row?).context("corrupt stored record")?);
    }
    Ok(out)
}

// ── State ─────────────────────────────────────────────────────────────────────

impl StateStore for SqliteStore {
    async fn read_state(&self, target: &str) -> Result<Option<StateSnapshot>> {
        let target = target.to_string();
        self.with_conn("read state", move |conn| {
            let latest = bodies(
                conn,
                "SELECT body FROM snapshots WHERE target_key = ?1 ORDER BY generation DESC LIMIT 1",
                params![target],
            )?;
            Ok(latest.into_iter().next())
        })
        .await
    }

    async fn write_state(
        &self,
        target: &str,
        snapshot: &StateSnapshot,
        expected_version: u64,
    ) -> Result<StateSnapshot> {
        let target = target.to_string();
        let mut stored = snapshot.clone();
        self.with_conn("write state", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let found: i64 = tx.query_row(
                "SELECT COALESCE(MAX(generation), 0) FROM snapshots WHERE target_key = ?1",
                params![target],
                |r| r.get(0),
            )?;
            let found = from_sql_int(found);
            if found != expected_version {
                return Err(DeployError::VersionConflict {
                    target,
                    expected: expected_version,
                    found,
                }
                .into());
            }
            stored.target_key.clone_from(&target);
            stored.generation = expected_version + 1;
            tx.execute(
                "INSERT INTO snapshots (target_key, generation, written_at, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    target,
                    to_sql_int(stored.generation),
                    ts(stored.written_at),
                    serde_json::to_string(&stored)?
                ],
            )?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }
}

// ── Locks ─────────────────────────────────────────────────────────────────────

impl LockManager for SqliteStore {
    async fn acquire_lock(&self, target: &str, holder: &str, ttl: Duration) -> Result<Lock> {
        let lock = Lock {
            target_key: target.to_string(),
            holder_id: holder.to_string(),
            acquired_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
        };
        self.with_conn("acquire lock", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(existing) = read_lock(&tx, &lock.target_key)? {
                // A live lock is never re-issued, not even to its own holder.
                if !existing.is_expired_at(lock.acquired_at) {
                    return Err(DeployError::LockHeld {
                        target: existing.target_key.clone(),
                        holder: existing.holder_id.clone(),
                        expires_at: existing.expires_at(),
                    }
                    .into());
                }
                tracing::info!(
                    target_key = %existing.target_key,
                    stale_holder = %existing.holder_id,
                    "replacing expired lock"
                );
            }
            upsert_lock(&tx, &lock)?;
            tx.commit()?;
            Ok(lock)
        })
        .await
    }

    async fn release_lock(&self, lock: &Lock) -> Result<bool> {
        let lock = lock.clone();
        self.with_conn("release lock", move |conn| {
            let deleted = conn.execute(
                "DELETE FROM locks WHERE target_key = ?1 AND holder_id = ?2 AND acquired_at = ?3",
                params![lock.target_key, lock.holder_id, ts(lock.acquired_at)],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn refresh_lock(&self, lock: &Lock) -> Result<Lock> {
        let held = lock.clone();
        self.with_conn("refresh lock", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = read_lock(&tx, &held.target_key)?;
            if !current.as_ref().is_some_and(|c| same_token(c, &held)) {
                return Err(DeployError::LockLost {
                    target: held.target_key.clone(),
                    holder: held.holder_id.clone(),
                }
                .into());
            }
            let refreshed = Lock {
                acquired_at: Utc::now(),
                ..held
            };
            upsert_lock(&tx, &refreshed)?;
            tx.commit()?;
            Ok(refreshed)
        })
        .await
    }

    async fn current_lock(&self, target: &str) -> Result<Option<Lock>> {
        let target = target.to_string();
        self.with_conn("read lock", move |conn| read_lock(conn, &target))
            .await
    }

    async fn force_release(&self, target: &str) -> Result<bool> {
        let target = target.to_string();
        self.with_conn("remove lock", move |conn| {
            let deleted = conn.execute("DELETE FROM locks WHERE target_key = ?1", params![target])?;
            Ok(deleted > 0)
        })
        .await
    }
}

// ── Approvals ─────────────────────────────────────────────────────────────────

impl ApprovalChannel for SqliteStore {
    async fn open_request(&self, request: &ApprovalRequest) -> Result<ApprovalRequest> {
        let request = request.clone();
        self.with_conn("open approval request", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing: Vec<ApprovalRequest> = bodies(
                &tx,
                "SELECT body FROM approval_requests WHERE run_id = ?1",
                params![request.run_id],
            )?;
            if let Some(stored) = existing.into_iter().next() {
                return Ok(stored);
            }
            tx.execute(
                "INSERT INTO approval_requests (run_id, target_key, body) VALUES (?1, ?2, ?3)",
                params![
                    request.run_id,
                    request.target_key,
                    serde_json::to_string(&request)?
                ],
            )?;
            tx.commit()?;
            Ok(request)
        })
        .await
    }

    async fn request(&self, run_id: &str) -> Result<Option<ApprovalRequest>> {
        let run_id = run_id.to_string();
        self.with_conn("read approval request", move |conn| {
            let found = bodies(
                conn,
                "SELECT body FROM approval_requests WHERE run_id = ?1",
                params![run_id],
            )?;
            Ok(found.into_iter().next())
        })
        .await
    }

    async fn decisions(&self, run_id: &str) -> Result<Vec<ApprovalDecision>> {
        let run_id = run_id.to_string();
        self.with_conn("read approval decisions", move |conn| {
            bodies(
                conn,
                "SELECT body FROM approval_decisions WHERE run_id = ?1 ORDER BY decided_at, rowid",
                params![run_id],
            )
        })
        .await
    }

    async fn record_decision(&self, decision: &ApprovalDecision) -> Result<bool> {
        let decision = decision.clone();
        self.with_conn("record decision", move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO approval_decisions (run_id, actor, decided_at, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    decision.run_id,
                    decision.actor,
                    ts(decision.decided_at),
                    serde_json::to_string(&decision)?
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }
}

// ── Journal ───────────────────────────────────────────────────────────────────

impl RunJournal for SqliteStore {
    async fn record_run(&self, report: &RunReport) -> Result<()> {
        let report = report.clone();
        self.with_conn("journal run", move |conn| {
            conn.execute(
                "INSERT INTO runs (run_id, target_key, finished_at, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    report.run_id,
                    report.target_key,
                    ts(report.finished_at),
                    serde_json::to_string(&report)?
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent_runs(&self, target: &str, limit: usize) -> Result<Vec<RunReport>> {
        let target = target.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn("read run journal", move |conn| {
            bodies(
                conn,
                "SELECT body FROM runs WHERE target_key = ?1 ORDER BY id DESC LIMIT ?2",
                params![target, limit],
            )
        })
        .await
    }
}
