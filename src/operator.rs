//! Operator-facing entry points. Every call returns `{success, message}` and
//! never panics on a failed operation.

use std::sync::Arc;

use serde::Serialize;

use crate::error::EngineError;
use crate::ledger::{ScoreChange, ScoreLedger, ScoreUpdate};
use crate::lifecycle::Lifecycle;
use crate::logging::{log_error, Domain};
use crate::model::Status;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpResult {
    pub success: bool,
    pub message: String,
}

impl OpResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn fail(err: &EngineError) -> Self {
        Self { success: false, message: err.to_string() }
    }
}

pub struct Operator {
    lifecycle: Arc<Lifecycle>,
    ledger: Arc<ScoreLedger>,
}

impl Operator {
    pub fn new(lifecycle: Arc<Lifecycle>, ledger: Arc<ScoreLedger>) -> Self {
        Self { lifecycle, ledger }
    }

    pub fn transition(&self, competition_id: &str, target: Status) -> OpResult {
        match self.lifecycle.transition(competition_id, target) {
            Ok(report) => OpResult::ok(report.message()),
            Err(err) => failed(Domain::Lifecycle, "transition_failed", competition_id, &err),
        }
    }

    pub fn set_score(&self, participant_id: &str, competition_id: &str, score: f64) -> OpResult {
        match self.ledger.set_score(participant_id, competition_id, score) {
            Ok(ScoreChange::Unchanged) => OpResult::ok("score unchanged"),
            Ok(ScoreChange::Updated { previous, current }) => {
                OpResult::ok(format!("score updated from {} to {}", previous, current))
            }
            Err(err) => failed(Domain::Ledger, "set_score_failed", competition_id, &err),
        }
    }

    pub fn undo_last(&self, participant_id: &str, competition_id: &str) -> OpResult {
        match self.ledger.undo_last(participant_id, competition_id) {
            Ok(out) => OpResult::ok(format!("score restored to {}", out.restored)),
            Err(err) => failed(Domain::Ledger, "undo_failed", competition_id, &err),
        }
    }

    pub fn bulk_set_score(&self, competition_id: &str, entries: &[ScoreUpdate]) -> OpResult {
        match self.ledger.bulk_set_score(competition_id, entries) {
            Ok(report) => OpResult::ok(report.message()),
            Err(err) => failed(Domain::Ledger, "bulk_score_failed", competition_id, &err),
        }
    }

    pub fn assign_award(&self, competition_id: &str, position: u8, amount: i64) -> OpResult {
        match self.lifecycle.assign_award(competition_id, position, amount) {
            Ok(w) => OpResult::ok(format!("award {} set for {} (position {})", w.award, w.participant_id, w.position)),
            Err(err) => failed(Domain::Lifecycle, "assign_award_failed", competition_id, &err),
        }
    }
}

/// Caller mistakes go straight back in the result; store failures are logged too.
fn failed(domain: Domain, event: &str, competition_id: &str, err: &EngineError) -> OpResult {
    if err.is_store_failure() {
        log_error(domain, event, Some(competition_id), err);
    }
    OpResult::fail(err)
}
