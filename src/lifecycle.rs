//! Competition lifecycle state machine.
//!
//! ```text
//!  REGISTRATION ──► IN_PROGRESS ──► FINISHED
//!       ▲  │            │  ▲            │
//!       │  └─► CANCELLED ◄┘  └────────────┘ (correction)
//!       └───────────────────────────────────┘
//! ```
//!
//! Entering FINISHED ranks registrations and records stats; leaving it reverts
//! exactly what was recorded. Both happen in the same transaction as the
//! status write. Stats effects are best-effort per participant: a failed
//! effect is rolled back to its savepoint and reported as skipped.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Transaction;
use serde::Serialize;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::logging::{log, log_side_effect_skipped, log_transition, obj, v_str, Domain, Level};
use crate::model::{Competition, Registration, Status, WinnerRecord, PODIUM_SIZE};
use crate::stats::{self, StatsChange, StatsOp};
use crate::store::{
    load_registrations, mark_started, require_competition, swap_status, write_result_photos,
    write_winners, Store,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum EffectOutcome {
    Applied,
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideEffect {
    pub participant_id: String,
    pub op: StatsOp,
    pub outcome: EffectOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionReport {
    pub competition_id: String,
    pub from: Status,
    pub to: Status,
    pub changed: bool,
    /// Why nothing changed, when `changed` is false.
    pub note: Option<String>,
    pub winners: Vec<WinnerRecord>,
    pub side_effects: Vec<SideEffect>,
}

impl TransitionReport {
    fn unchanged(competition_id: &str, status: Status, note: String) -> Self {
        Self {
            competition_id: competition_id.to_string(),
            from: status,
            to: status,
            changed: false,
            note: Some(note),
            winners: Vec::new(),
            side_effects: Vec::new(),
        }
    }

    fn changed(competition_id: &str, from: Status, to: Status) -> Self {
        Self {
            competition_id: competition_id.to_string(),
            from,
            to,
            changed: true,
            note: None,
            winners: Vec::new(),
            side_effects: Vec::new(),
        }
    }

    pub fn skipped(&self) -> impl Iterator<Item = &SideEffect> {
        self.side_effects
            .iter()
            .filter(|e| matches!(e.outcome, EffectOutcome::Skipped(_)))
    }

    pub fn message(&self) -> String {
        if !self.changed {
            return self.note.clone().unwrap_or_else(|| "no change".to_string());
        }
        let mut msg = format!("competition {} moved {} -> {}", self.competition_id, self.from, self.to);
        if !self.winners.is_empty() {
            msg.push_str(&format!("; {} winner(s)", self.winners.len()));
        }
        let skipped = self.skipped().count();
        if skipped > 0 {
            msg.push_str(&format!("; {} stats update(s) skipped", skipped));
        }
        msg
    }
}

/// Who asked for a transition. Automatic triggers re-check their selection
/// condition under the transaction, since an operator may have moved first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Operator,
    AutoStart,
    AutoFinish { cutoff: DateTime<Utc> },
}

impl Trigger {
    fn stale_reason(&self, comp: &Competition, now: DateTime<Utc>) -> Option<String> {
        match self {
            Trigger::Operator => None,
            Trigger::AutoStart => {
                let due = comp.status == Status::Registration
                    && !comp.auto_started
                    && comp.scheduled_start <= now;
                (!due).then(|| format!("competition {} no longer due to start", comp.id))
            }
            Trigger::AutoFinish { cutoff } => {
                let due = comp.status == Status::InProgress
                    && comp.started_at.map_or(false, |t| t <= *cutoff);
                (!due).then(|| format!("competition {} no longer due to finish", comp.id))
            }
        }
    }
}

pub fn is_allowed(from: Status, to: Status) -> bool {
    use Status::*;
    matches!(
        (from, to),
        (Registration, InProgress)
            | (Registration, Finished)
            | (Registration, Cancelled)
            | (InProgress, Finished)
            | (InProgress, Cancelled)
            | (InProgress, Registration)
            | (Finished, InProgress)
            | (Finished, Registration)
            | (Cancelled, Registration)
            | (Cancelled, InProgress)
            | (Cancelled, Finished)
    )
}

/// Top three positive scores in descending order. Ties keep enrollment order.
pub fn compute_winners(registrations: &[Registration]) -> Vec<WinnerRecord> {
    let mut ranked: Vec<&Registration> = registrations.iter().filter(|r| r.score > 0.0).collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    ranked
        .into_iter()
        .take(PODIUM_SIZE)
        .enumerate()
        .map(|(i, r)| WinnerRecord {
            position: (i + 1) as u8,
            participant_id: r.participant_id.clone(),
            award: 0,
        })
        .collect()
}

pub fn finish_effects(registrations: &[Registration], winners: &[WinnerRecord]) -> Vec<(String, StatsOp)> {
    let mut plan: Vec<(String, StatsOp)> = registrations
        .iter()
        .map(|r| (r.participant_id.clone(), StatsOp::RecordMatchPlayed))
        .collect();
    plan.extend(
        winners
            .iter()
            .map(|w| (w.participant_id.clone(), StatsOp::RecordWin { position: w.position })),
    );
    plan
}

pub fn unfinish_effects(registrations: &[Registration], winners: &[WinnerRecord]) -> Vec<(String, StatsOp)> {
    let mut plan = Vec::new();
    for w in winners {
        if w.award > 0 {
            plan.push((w.participant_id.clone(), StatsOp::RevertCurrency { amount: w.award }));
        }
        if (1..=PODIUM_SIZE as u8).contains(&w.position) {
            plan.push((w.participant_id.clone(), StatsOp::RevertWin { position: w.position }));
        }
    }
    plan.extend(
        registrations
            .iter()
            .map(|r| (r.participant_id.clone(), StatsOp::RevertMatchPlayed)),
    );
    plan
}

fn apply_effects(
    tx: &mut Transaction<'_>,
    competition_id: &str,
    plan: Vec<(String, StatsOp)>,
) -> Result<Vec<SideEffect>, EngineError> {
    let mut out = Vec::with_capacity(plan.len());
    for (participant_id, op) in plan {
        let sp = tx.savepoint()?;
        let outcome = match stats::apply(&sp, &participant_id, op) {
            Ok(change) => {
                sp.commit()?;
                match change {
                    StatsChange::Applied => EffectOutcome::Applied,
                    StatsChange::NoRow => EffectOutcome::Skipped("no stats row".to_string()),
                }
            }
            Err(err) => {
                // dropping the savepoint rolls this participant back
                drop(sp);
                EffectOutcome::Skipped(err.to_string())
            }
        };
        if let EffectOutcome::Skipped(reason) = &outcome {
            log_side_effect_skipped(competition_id, &participant_id, op.name(), reason);
        }
        out.push(SideEffect { participant_id, op, outcome });
    }
    Ok(out)
}

pub struct Lifecycle {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl Lifecycle {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Operator-triggered transition.
    pub fn transition(&self, competition_id: &str, target: Status) -> Result<TransitionReport, EngineError> {
        self.run(competition_id, target, self.clock.now(), Trigger::Operator)
    }

    /// Scheduler start: REGISTRATION -> IN_PROGRESS, latching `auto_started`.
    pub fn auto_start(&self, competition_id: &str, now: DateTime<Utc>) -> Result<TransitionReport, EngineError> {
        self.run(competition_id, Status::InProgress, now, Trigger::AutoStart)
    }

    /// Scheduler finish for competitions started at or before `cutoff`.
    pub fn auto_finish(
        &self,
        competition_id: &str,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<TransitionReport, EngineError> {
        self.run(competition_id, Status::Finished, now, Trigger::AutoFinish { cutoff })
    }

    fn run(
        &self,
        competition_id: &str,
        target: Status,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<TransitionReport, EngineError> {
        let report = self.store.with_tx(|tx| {
            let comp = require_competition(tx, competition_id)?;
            let from = comp.status;
            if let Some(reason) = trigger.stale_reason(&comp, now) {
                return Ok(TransitionReport::unchanged(competition_id, from, reason));
            }
            if from == target {
                return Ok(TransitionReport::unchanged(
                    competition_id,
                    from,
                    format!("competition {} is already {}", competition_id, from),
                ));
            }
            if !is_allowed(from, target) {
                return Err(EngineError::InvalidTransition { from, to: target });
            }

            let registrations = load_registrations(tx, competition_id)?;
            let mut report = TransitionReport::changed(competition_id, from, target);

            if from == Status::Finished {
                let plan = unfinish_effects(&registrations, &comp.winners);
                report.side_effects = apply_effects(tx, competition_id, plan)?;
                write_winners(tx, competition_id, &[])?;
                write_result_photos(tx, competition_id, &[])?;
                swap_status(tx, competition_id, from, target)?;
            } else if target == Status::Finished {
                let winners = compute_winners(&registrations);
                write_winners(tx, competition_id, &winners)?;
                swap_status(tx, competition_id, from, target)?;
                let plan = finish_effects(&registrations, &winners);
                report.side_effects = apply_effects(tx, competition_id, plan)?;
                report.winners = winners;
            } else {
                swap_status(tx, competition_id, from, target)?;
            }

            // a competition finished without passing through IN_PROGRESS still gets a start time
            if matches!(target, Status::InProgress | Status::Finished) {
                mark_started(tx, competition_id, now, trigger == Trigger::AutoStart)?;
            }
            Ok(report)
        })?;

        if report.changed {
            log_transition(
                competition_id,
                report.from,
                report.to,
                &report.winners,
                report.skipped().count(),
            );
        }
        Ok(report)
    }

    /// Sets the currency award for a podium position and moves the winner's
    /// balance by the difference from the previous award.
    pub fn assign_award(&self, competition_id: &str, position: u8, amount: i64) -> Result<WinnerRecord, EngineError> {
        if amount < 0 {
            return Err(EngineError::InvalidAward(amount));
        }
        let winner = self.store.with_tx(|tx| {
            let mut comp = require_competition(tx, competition_id)?;
            if comp.status != Status::Finished {
                return Err(EngineError::WrongStatus {
                    competition_id: competition_id.to_string(),
                    status: comp.status,
                });
            }
            let winner = comp
                .winners
                .iter_mut()
                .find(|w| w.position == position)
                .ok_or_else(|| EngineError::not_found("winner", format!("{}#{}", competition_id, position)))?;
            let delta = amount - winner.award;
            if delta != 0 {
                stats::credit_currency(tx, &winner.participant_id, delta)?;
            }
            winner.award = amount;
            let updated = winner.clone();
            write_winners(tx, competition_id, &comp.winners)?;
            Ok(updated)
        })?;
        log(
            Level::Info,
            Domain::Lifecycle,
            "award_assigned",
            obj(&[
                ("competition_id", v_str(competition_id)),
                ("participant_id", v_str(&winner.participant_id)),
                ("position", serde_json::json!(position)),
                ("award", serde_json::json!(amount)),
            ]),
        );
        Ok(winner)
    }

    pub fn set_result_photos(&self, competition_id: &str, photos: &[String]) -> Result<(), EngineError> {
        self.store.with_tx(|tx| {
            let comp = require_competition(tx, competition_id)?;
            if comp.status != Status::Finished {
                return Err(EngineError::WrongStatus {
                    competition_id: competition_id.to_string(),
                    status: comp.status,
                });
            }
            write_result_photos(tx, competition_id, photos)
        })
    }
}
