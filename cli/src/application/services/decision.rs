//! Application service: recording approve/reject decisions.

use anyhow::{Context, Result};
use chrono::Utc;
use keel_common::{ApprovalDecision, Verdict, validate_actor, validate_run_id};

use crate::application::ports::ApprovalChannel;
use crate::domain::approval::{Ignored, counts};

/// Record `actor`'s verdict on a run waiting for approval.
///
/// # Errors
///
/// Fails when the run has no approval request, when the actor initiated the
/// run or is not a listed approver, and when the actor already decided.
pub async fn decide(
    channel: &impl ApprovalChannel,
    run_id: &str,
    actor: &str,
    verdict: Verdict,
    comment: Option<String>,
) -> Result<ApprovalDecision> {
    validate_run_id(run_id)?;
    validate_actor(actor)?;

    let request = channel
        .request(run_id)
        .await?
        .with_context(|| format!("run {run_id} is not waiting for approval"))?;

    let decision = ApprovalDecision {
        run_id: run_id.to_string(),
        actor: actor.to_string(),
        verdict,
        decided_at: Utc::now(),
        comment,
    };
    match counts(&request, &decision) {
        Ok(()) => {}
        Err(Ignored::SelfApproval) => {
            anyhow::bail!("{actor} initiated run {run_id} and cannot decide on it")
        }
        Err(Ignored::NotAnApprover) => anyhow::bail!(
            "{actor} is not an approver for target '{}' (approvers: {})",
            request.target_key,
            request.required_approvers.join(", ")
        ),
    }

    if !channel.record_decision(&decision).await? {
        anyhow::bail!("{actor} already decided on run {run_id}");
    }
    tracing::info!(
        run_id,
        actor,
        verdict = verdict.as_str(),
        "approval decision recorded"
    );
    Ok(decision)
}
