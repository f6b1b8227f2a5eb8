//! Readiness waiting: poll a signal on the endpoint until it reports ready.

use std::future::Future;

use anyhow::Result;
use keel_common::{Endpoint, Readiness};
use tokio_util::sync::CancellationToken;

use crate::application::ports::RemoteExecutor;
use crate::application::services::poll::{Polled, poll_until};
use crate::domain::bootstrap::BOOT_MARKER;
use crate::domain::error::DeployError;
use crate::domain::retry::PollPolicy;
use crate::domain::workload::shell_quote;

/// Poll `signal` until it returns `Ok(true)`.
///
/// Errors from `signal` count as "not ready yet". On success the endpoint's
/// readiness becomes [`Readiness::Ready`]; on timeout it becomes
/// [`Readiness::Failed`].
///
/// # Errors
///
/// Fails with [`DeployError::Timeout`] or [`DeployError::Cancelled`].
pub async fn wait_ready<F, Fut>(
    endpoint: &mut Endpoint,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut signal: F,
) -> Result<u32>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    endpoint.readiness = Readiness::Pending;
    let owned = endpoint.address.clone();
    let address = owned.as_str();
    let polled = poll_until(policy, cancel, move || {
        let probe = signal(address.to_string());
        async move {
            match probe.await {
                Ok(true) => Some(()),
                Ok(false) => None,
                Err(e) => {
                    tracing::debug!(address, error = %e, "readiness probe failed");
                    None
                }
            }
        }
    })
    .await?;

    match polled {
        Polled::Ready { polls, .. } => {
            endpoint.readiness = Readiness::Ready;
            tracing::info!(address = %endpoint.address, polls, "endpoint ready");
            Ok(polls)
        }
        Polled::TimedOut { polls } => {
            endpoint.readiness = Readiness::Failed;
            tracing::warn!(address = %endpoint.address, polls, "endpoint never became ready");
            Err(DeployError::Timeout {
                what: format!("readiness of {}", endpoint.address),
                secs: policy.timeout.as_secs(),
            }
            .into())
        }
    }
}

/// The boot-completion signal: the bootstrap script's marker file exists.
///
/// # Errors
///
/// Propagates channel failures from the executor.
pub async fn boot_marker_present(remote: &impl RemoteExecutor, host: &str) -> Result<bool> {
    let output = remote
        .exec(host, &format!("test -f {}", shell_quote(BOOT_MARKER)))
        .await?;
    Ok(output.status.success())
}
