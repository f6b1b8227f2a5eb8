//! The deployment run aggregate and its forward-only state machine.

use chrono::{DateTime, Utc};
use keel_common::{
    ChangeSet, Endpoint, FailureDetail, RunKind, RunReport, RunStage, StageTransition,
    StateSnapshot, VerificationResult,
};

use crate::domain::error::TransitionError;

/// One orchestrated run against one target. Lives until its report is
/// written; the lock it acquires is released before that.
#[derive(Debug, Clone)]
pub struct DeploymentRun {
    pub run_id: String,
    pub target_key: String,
    pub kind: RunKind,
    pub initiator: String,
    stage: RunStage,
    stages: Vec<StageTransition>,
    pub change_set: Option<ChangeSet>,
    pub snapshot: Option<StateSnapshot>,
    pub endpoint: Option<Endpoint>,
    pub verification: Option<VerificationResult>,
    failure: Option<FailureDetail>,
    started_at: DateTime<Utc>,
}

impl DeploymentRun {
    #[must_use]
    pub fn new(
        run_id: &str,
        target_key: &str,
        kind: RunKind,
        initiator: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            target_key: target_key.to_string(),
            kind,
            initiator: initiator.to_string(),
            stage: RunStage::Init,
            stages: Vec::new(),
            change_set: None,
            snapshot: None,
            endpoint: None,
            verification: None,
            failure: None,
            started_at: now,
        }
    }

    #[must_use]
    pub fn stage(&self) -> RunStage {
        self.stage
    }

    #[must_use]
    pub fn failure(&self) -> Option<&FailureDetail> {
        self.failure.as_ref()
    }

    #[must_use]
    pub fn stages(&self) -> &[StageTransition] {
        &self.stages
    }

    /// Move forward to `to`. Stages may be skipped but never revisited.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when `to` is not strictly later than the
    /// current stage, when the run is already terminal, or when `to` is one
    /// of the stages reserved for [`fail`](Self::fail) and
    /// [`finish`](Self::finish).
    pub fn advance(&mut self, to: RunStage, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let from = self.stage;
        if from.is_terminal() || to <= from || matches!(to, RunStage::Failed | RunStage::Released) {
            return Err(TransitionError { from, to });
        }
        self.transition(to, now);
        Ok(())
    }

    /// Mark the run failed at its current stage. A run that is already
    /// terminal keeps its first outcome.
    pub fn fail(&mut self, code: &str, message: &str, now: DateTime<Utc>) {
        if self.stage.is_terminal() {
            return;
        }
        self.failure = Some(FailureDetail {
            stage: self.stage,
            code: code.to_string(),
            message: message.to_string(),
        });
        self.transition(RunStage::Failed, now);
    }

    /// Record the lock release and produce the terminal report.
    #[must_use]
    pub fn finish(mut self, lock_released: bool, now: DateTime<Utc>) -> RunReport {
        if !self.stage.is_terminal() {
            self.fail("internal", "run ended without reaching a terminal stage", now);
        }
        let final_state = self.stage;
        self.stages.push(StageTransition {
            from: final_state,
            to: RunStage::Released,
            at: now,
        });
        RunReport {
            run_id: self.run_id,
            target_key: self.target_key,
            kind: self.kind,
            final_state,
            stages: self.stages,
            change_set: self.change_set,
            snapshot: self.snapshot,
            endpoint: self.endpoint,
            verification: self.verification,
            failure: self.failure,
            lock_released,
            started_at: self.started_at,
            finished_at: now,
        }
    }

    fn transition(&mut self, to: RunStage, now: DateTime<Utc>) {
        self.stages.push(StageTransition {
            from: self.stage,
            to,
            at: now,
        });
        self.stage = to;
    }
}
