//! Generic polling and retry primitives.
//!
//! Every wait in a run goes through these two functions so that
//! cancellation and deadlines behave the same everywhere.

use std::fmt::Display;
use std::future::Future;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::error::{DeployError, ProviderError};
use crate::domain::retry::{PollPolicy, RetryPolicy};

/// Outcome of [`poll_until`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled<T> {
    Ready { value: T, polls: u32 },
    TimedOut { polls: u32 },
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// # Errors
///
/// Fails with [`DeployError::Cancelled`].
pub async fn sleep_or_cancel(delay: std::time::Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(DeployError::Cancelled.into()),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Call `check` every `policy.interval` until it yields a value or
/// `policy.timeout` has elapsed.
///
/// The first check runs immediately. After the deadline one final check has
/// always been made, so a timeout is reported no later than
/// `timeout + interval` after the start (plus the duration of the checks).
///
/// # Errors
///
/// Fails with [`DeployError::Cancelled`] when `cancel` fires.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<Polled<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut polls = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled.into());
        }
        polls += 1;
        if let Some(value) = check().await {
            return Ok(Polled::Ready { value, polls });
        }
        if Instant::now() >= deadline {
            return Ok(Polled::TimedOut { polls });
        }
        sleep_or_cancel(policy.interval, cancel).await?;
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Sleeps `policy.delay_for(attempt)` between tries.
///
/// # Errors
///
/// Returns the last error, or [`DeployError::Cancelled`].
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<anyhow::Error> + Display,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled.into());
        }
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) && policy.allows_retry_after(attempt) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = what,
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "retrying after transient failure"
                );
                sleep_or_cancel(delay, cancel).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// [`retry`] specialised to provider calls: only transient errors retry.
///
/// # Errors
///
/// Returns the terminal or last transient [`ProviderError`], or
/// [`DeployError::Cancelled`].
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ProviderError>>,
{
    retry(policy, cancel, what, ProviderError::is_transient, op).await
}
