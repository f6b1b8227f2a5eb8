//! Human approval checkpoint for mutating runs.
//!
//! The request is persisted before waiting, so a run restarted with the same
//! run id picks up decisions recorded while it was away.

use std::collections::BTreeSet;
use std::sync::Mutex;

use anyhow::Result;
use keel_common::ApprovalRequest;
use tokio_util::sync::CancellationToken;

use crate::application::ports::ApprovalChannel;
use crate::application::services::poll::{Polled, poll_until};
use crate::domain::approval::{ApprovalState, Ignored, counts, evaluate};
use crate::domain::error::DeployError;
use crate::domain::retry::PollPolicy;

/// Persist `request` (or reuse the stored one) and wait for a counted
/// decision. Returns the approving actor.
///
/// # Errors
///
/// Fails with [`DeployError::ApprovalRejected`],
/// [`DeployError::ApprovalTimeout`] or [`DeployError::Cancelled`].
pub async fn await_approval(
    channel: &impl ApprovalChannel,
    request: &ApprovalRequest,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<String> {
    let stored = channel.open_request(request).await?;
    if stored.target_key != request.target_key {
        anyhow::bail!(
            "run {} already awaits approval for target '{}'",
            stored.run_id,
            stored.target_key
        );
    }
    tracing::info!(
        run_id = %stored.run_id,
        approvers = %stored.required_approvers.join(","),
        "waiting for approval"
    );

    let seen: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());
    let seen = &seen;
    let stored = &stored;
    let polled = poll_until(policy, cancel, move || async move {
        let decisions = match channel.decisions(&stored.run_id).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(run_id = %stored.run_id, error = %e, "cannot read decisions");
                return None;
            }
        };
        for d in &decisions {
            if let Err(why) = counts(stored, d) {
                let first_time = seen
                    .lock()
                    .map(|mut s| s.insert(d.actor.clone()))
                    .unwrap_or(false);
                if first_time {
                    let reason = match why {
                        Ignored::NotAnApprover => "not an approver",
                        Ignored::SelfApproval => "initiator cannot approve own run",
                    };
                    tracing::warn!(
                        run_id = %stored.run_id,
                        actor = %d.actor,
                        reason,
                        "ignoring decision"
                    );
                }
            }
        }
        match evaluate(stored, &decisions) {
            ApprovalState::Pending => None,
            decided => Some(decided),
        }
    })
    .await?;

    match polled {
        Polled::Ready {
            value: ApprovalState::Approved { actor },
            ..
        } => {
            tracing::info!(run_id = %stored.run_id, actor = %actor, "run approved");
            Ok(actor)
        }
        Polled::Ready {
            value: ApprovalState::Rejected { actor },
            ..
        } => Err(DeployError::ApprovalRejected {
            run_id: stored.run_id.clone(),
            actor,
        }
        .into()),
        Polled::Ready {
            value: ApprovalState::Pending,
            ..
        }
        | Polled::TimedOut { .. } => Err(DeployError::ApprovalTimeout {
            run_id: stored.run_id.clone(),
            secs: policy.timeout.as_secs(),
        }
        .into()),
    }
}
