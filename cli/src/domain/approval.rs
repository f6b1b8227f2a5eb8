//! Approval decision evaluation.

use keel_common::{ApprovalDecision, ApprovalRequest, Verdict};

/// Outcome of evaluating the decisions recorded so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalState {
    Pending,
    Approved { actor: String },
    Rejected { actor: String },
}

/// Why a decision was not counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    NotAnApprover,
    SelfApproval,
}

/// Whether `decision` counts toward `request`.
///
/// # Errors
///
/// Returns the reason it was ignored.
pub fn counts(request: &ApprovalRequest, decision: &ApprovalDecision) -> Result<(), Ignored> {
    if decision.actor == request.initiator {
        return Err(Ignored::SelfApproval);
    }
    if !request.required_approvers.iter().any(|a| *a == decision.actor) {
        return Err(Ignored::NotAnApprover);
    }
    Ok(())
}

/// Evaluate decisions in the order they were recorded.
///
/// The earliest counted rejection wins over any approval; otherwise the
/// earliest counted approval approves.
#[must_use]
pub fn evaluate(request: &ApprovalRequest, decisions: &[ApprovalDecision]) -> ApprovalState {
    let mut ordered: Vec<&ApprovalDecision> = decisions
        .iter()
        .filter(|d| d.run_id == request.run_id && counts(request, d).is_ok())
        .collect();
    ordered.sort_by_key(|d| d.decided_at);

    if let Some(d) = ordered.iter().find(|d| d.verdict == Verdict::Rejected) {
        return ApprovalState::Rejected {
            actor: d.actor.clone(),
        };
    }
    match ordered.first() {
        Some(d) => ApprovalState::Approved {
            actor: d.actor.clone(),
        },
        None => ApprovalState::Pending,
    }
}
