//! Per-registration score ledger with bounded single-step undo.
//!
//! The ledger keeps undo only. Redo belongs to whoever drives the ledger; see
//! [`RedoStack`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{to_millis, Clock};
use crate::error::EngineError;
use crate::logging::{log, log_error, log_score_change, obj, v_str, Domain, Level};
use crate::model::{Registration, ScoreEntry, ScoreHistory};
use crate::store::{load_registration, require_competition, require_registration, write_registration_score, Store};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreChange {
    Unchanged,
    Updated { previous: f64, current: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UndoOutcome {
    /// Score that was in place before the undo.
    pub undone: f64,
    /// Score restored from history.
    pub restored: f64,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub participant_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkReport {
    pub applied: Vec<String>,
    pub missing: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BulkReport {
    pub fn message(&self) -> String {
        let mut msg = format!("{} score(s) updated", self.applied.len());
        if !self.unchanged.is_empty() {
            msg.push_str(&format!(", {} unchanged", self.unchanged.len()));
        }
        if !self.missing.is_empty() {
            msg.push_str(&format!(", {} not registered", self.missing.len()));
        }
        if !self.failed.is_empty() {
            msg.push_str(&format!(", {} failed", self.failed.len()));
        }
        msg
    }
}

pub struct ScoreLedger {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    history_cap: usize,
}

impl ScoreLedger {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, history_cap: usize) -> Self {
        Self { store, clock, history_cap: history_cap.max(1) }
    }

    pub fn set_score(&self, participant_id: &str, competition_id: &str, new_score: f64) -> Result<ScoreChange, EngineError> {
        check_score(new_score)?;
        let ts = to_millis(self.clock.now());
        let cap = self.history_cap;
        let change = self.store.with_tx(|tx| {
            let mut reg = require_registration(tx, participant_id, competition_id)?;
            let change = apply_score(&mut reg, new_score, ts, cap);
            if change != ScoreChange::Unchanged {
                write_registration_score(tx, &reg)?;
            }
            Ok((change, reg.history.len()))
        });
        let (change, depth) = change?;
        if let ScoreChange::Updated { previous, current } = change {
            log_score_change(competition_id, participant_id, "score_set", previous, current, depth);
        }
        Ok(change)
    }

    pub fn undo_last(&self, participant_id: &str, competition_id: &str) -> Result<UndoOutcome, EngineError> {
        let outcome = self.store.with_tx(|tx| {
            let mut reg = require_registration(tx, participant_id, competition_id)?;
            let entry = reg.history.pop().ok_or(EngineError::EmptyHistory)?;
            let undone = reg.score;
            reg.score = entry.previous_score;
            write_registration_score(tx, &reg)?;
            Ok(UndoOutcome {
                undone,
                restored: reg.score,
                remaining: reg.history.len(),
            })
        })?;
        log_score_change(
            competition_id,
            participant_id,
            "score_undo",
            outcome.undone,
            outcome.restored,
            outcome.remaining,
        );
        Ok(outcome)
    }

    /// Applies entries in order, each in its own transaction. Entries without a
    /// registration or with an unchanged score are skipped, non-finite scores are
    /// reported as failed. One failure does not roll back entries already applied.
    pub fn bulk_set_score(&self, competition_id: &str, entries: &[ScoreUpdate]) -> Result<BulkReport, EngineError> {
        self.store.read(|conn| require_competition(conn, competition_id).map(|_| ()))?;
        let ts = to_millis(self.clock.now());
        let cap = self.history_cap;
        let mut report = BulkReport::default();

        for entry in entries {
            let pid = entry.participant_id.as_str();
            if let Err(err) = check_score(entry.score) {
                log_error(Domain::Ledger, "bulk_entry_rejected", Some(competition_id), &err);
                report.failed.push((pid.to_string(), err.to_string()));
                continue;
            }
            let res = self.store.with_tx(|tx| {
                let Some(mut reg) = load_registration(tx, pid, competition_id)? else {
                    return Ok(None);
                };
                let change = apply_score(&mut reg, entry.score, ts, cap);
                if change != ScoreChange::Unchanged {
                    write_registration_score(tx, &reg)?;
                }
                Ok(Some(change))
            });
            match res {
                Ok(None) => report.missing.push(pid.to_string()),
                Ok(Some(ScoreChange::Unchanged)) => report.unchanged.push(pid.to_string()),
                Ok(Some(ScoreChange::Updated { .. })) => report.applied.push(pid.to_string()),
                Err(err) => {
                    log_error(Domain::Ledger, "bulk_entry_failed", Some(competition_id), &err);
                    report.failed.push((pid.to_string(), err.to_string()));
                }
            }
        }

        log(
            Level::Info,
            Domain::Ledger,
            "bulk_score",
            obj(&[
                ("competition_id", v_str(competition_id)),
                ("msg", v_str(&report.message())),
            ]),
        );
        Ok(report)
    }

    pub fn history(&self, participant_id: &str, competition_id: &str) -> Result<ScoreHistory, EngineError> {
        Ok(self.store.registration(participant_id, competition_id)?.history)
    }
}

/// History entries are stored as JSON, which has no encoding for NaN or infinity.
fn check_score(score: f64) -> Result<(), EngineError> {
    if score.is_finite() {
        Ok(())
    } else {
        Err(EngineError::InvalidScore(score))
    }
}

fn apply_score(reg: &mut Registration, new_score: f64, ts: i64, cap: usize) -> ScoreChange {
    if reg.score == new_score {
        return ScoreChange::Unchanged;
    }
    let previous = reg.score;
    reg.history.push(ScoreEntry { previous_score: previous, ts }, cap);
    reg.score = new_score;
    ScoreChange::Updated { previous, current: new_score }
}

/// Caller-owned redo stack. Feed it from [`ScoreLedger::undo_last`] and replay
/// through [`ScoreLedger::set_score`]. Any fresh edit should clear it.
#[derive(Debug, Clone)]
pub struct RedoStack {
    scores: Vec<f64>,
    cap: usize,
}

impl RedoStack {
    pub fn new(cap: usize) -> Self {
        Self { scores: Vec::new(), cap: cap.max(1) }
    }

    pub fn record_undo(&mut self, outcome: &UndoOutcome) {
        self.scores.push(outcome.undone);
        if self.scores.len() > self.cap {
            self.scores.remove(0);
        }
    }

    pub fn clear(&mut self) {
        self.scores.clear();
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Re-applies the most recently undone score, if any.
    pub fn redo(
        &mut self,
        ledger: &ScoreLedger,
        participant_id: &str,
        competition_id: &str,
    ) -> Result<Option<ScoreChange>, EngineError> {
        let Some(score) = self.scores.pop() else {
            return Ok(None);
        };
        match ledger.set_score(participant_id, competition_id, score) {
            Ok(change) => Ok(Some(change)),
            Err(err) => {
                self.scores.push(score);
                Err(err)
            }
        }
    }
}
