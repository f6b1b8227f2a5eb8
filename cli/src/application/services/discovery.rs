//! Endpoint discovery: the recorded instance first, then a tag lookup.

use anyhow::Result;
use keel_common::{Endpoint, StateSnapshot};
use tokio_util::sync::CancellationToken;

use crate::application::ports::CloudProvider;
use crate::application::services::poll::retry_transient;
use crate::domain::discovery::{from_snapshot, select_candidate};
use crate::domain::error::DeployError;
use crate::domain::retry::RetryPolicy;

/// Resolve the address of the workload host for `snapshot.target_key`.
///
/// # Errors
///
/// Fails with [`DeployError::NotFound`] when neither the snapshot nor the
/// provider yields exactly one live, addressable instance.
pub async fn discover(
    provider: &impl CloudProvider,
    snapshot: &StateSnapshot,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Endpoint> {
    let target = snapshot.target_key.as_str();
    if let Some(endpoint) = from_snapshot(snapshot) {
        tracing::debug!(target_key = target, address = %endpoint.address, "endpoint from state");
        return Ok(endpoint);
    }

    tracing::info!(target_key = target, "no recorded endpoint, searching by tag");
    let instances = retry_transient(retry, cancel, "find instances", || {
        provider.find_instances_by_tag(target)
    })
    .await?;
    select_candidate(&instances).map_err(|reason| {
        DeployError::NotFound {
            target: target.to_string(),
            reason,
        }
        .into()
    })
}
