//! Aggregate participant stats, applied and reverted as side effects of
//! lifecycle transitions.
//!
//! Every mutation is a single in-SQL increment or decrement, so concurrent
//! effects on the same participant from different competitions never lose an
//! update. Decrements clamp at zero. Pairing of record/revert calls is the
//! caller's job.

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::EngineError;
use crate::store::participant_exists;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StatsOp {
    RecordMatchPlayed,
    RevertMatchPlayed,
    RecordWin { position: u8 },
    RevertWin { position: u8 },
    CreditCurrency { amount: i64 },
    RevertCurrency { amount: i64 },
}

impl StatsOp {
    pub fn name(&self) -> &'static str {
        match self {
            StatsOp::RecordMatchPlayed => "record_match_played",
            StatsOp::RevertMatchPlayed => "revert_match_played",
            StatsOp::RecordWin { .. } => "record_win",
            StatsOp::RevertWin { .. } => "revert_win",
            StatsOp::CreditCurrency { .. } => "credit_currency",
            StatsOp::RevertCurrency { .. } => "revert_currency",
        }
    }
}

/// What a single stats call did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsChange {
    Applied,
    /// A revert found no stats row to act on.
    NoRow,
}

pub fn apply(conn: &Connection, participant_id: &str, op: StatsOp) -> Result<StatsChange, EngineError> {
    match op {
        StatsOp::RecordMatchPlayed => record_match_played(conn, participant_id),
        StatsOp::RevertMatchPlayed => revert_match_played(conn, participant_id),
        StatsOp::RecordWin { position } => record_win(conn, participant_id, position),
        StatsOp::RevertWin { position } => revert_win(conn, participant_id, position),
        StatsOp::CreditCurrency { amount } => credit_currency(conn, participant_id, amount),
        StatsOp::RevertCurrency { amount } => revert_currency(conn, participant_id, amount),
    }
}

fn position_column(position: u8) -> Result<&'static str, EngineError> {
    match position {
        1 => Ok("wins_first"),
        2 => Ok("wins_second"),
        3 => Ok("wins_third"),
        other => Err(EngineError::InvalidPosition(other)),
    }
}

fn require_participant(conn: &Connection, participant_id: &str) -> Result<(), EngineError> {
    if participant_exists(conn, participant_id)? {
        Ok(())
    } else {
        Err(EngineError::not_found("participant", participant_id))
    }
}

fn changed(rows: usize) -> StatsChange {
    if rows == 0 {
        StatsChange::NoRow
    } else {
        StatsChange::Applied
    }
}

pub fn record_match_played(conn: &Connection, participant_id: &str) -> Result<StatsChange, EngineError> {
    require_participant(conn, participant_id)?;
    conn.execute(
        "INSERT INTO participant_stats (participant_id, matches_played) VALUES (?1, 1)
         ON CONFLICT(participant_id) DO UPDATE SET matches_played = matches_played + 1",
        params![participant_id],
    )?;
    Ok(StatsChange::Applied)
}

pub fn revert_match_played(conn: &Connection, participant_id: &str) -> Result<StatsChange, EngineError> {
    let n = conn.execute(
        "UPDATE participant_stats SET matches_played = MAX(matches_played - 1, 0)
         WHERE participant_id = ?1",
        params![participant_id],
    )?;
    Ok(changed(n))
}

pub fn record_win(conn: &Connection, participant_id: &str, position: u8) -> Result<StatsChange, EngineError> {
    let col = position_column(position)?;
    require_participant(conn, participant_id)?;
    let sql = format!(
        "INSERT INTO participant_stats (participant_id, wins, {col}) VALUES (?1, 1, 1)
         ON CONFLICT(participant_id) DO UPDATE SET wins = wins + 1, {col} = {col} + 1"
    );
    conn.execute(&sql, params![participant_id])?;
    Ok(StatsChange::Applied)
}

pub fn revert_win(conn: &Connection, participant_id: &str, position: u8) -> Result<StatsChange, EngineError> {
    let col = position_column(position)?;
    let sql = format!(
        "UPDATE participant_stats SET wins = MAX(wins - 1, 0), {col} = MAX({col} - 1, 0)
         WHERE participant_id = ?1"
    );
    let n = conn.execute(&sql, params![participant_id])?;
    Ok(changed(n))
}

/// Balance moves are exact; a balance may go negative if an award was
/// already spent when its competition is reverted.
pub fn credit_currency(conn: &Connection, participant_id: &str, amount: i64) -> Result<StatsChange, EngineError> {
    require_participant(conn, participant_id)?;
    conn.execute(
        "INSERT INTO participant_stats (participant_id, currency_balance) VALUES (?1, ?2)
         ON CONFLICT(participant_id) DO UPDATE SET currency_balance = currency_balance + ?2",
        params![participant_id, amount],
    )?;
    Ok(StatsChange::Applied)
}

pub fn revert_currency(conn: &Connection, participant_id: &str, amount: i64) -> Result<StatsChange, EngineError> {
    let n = conn.execute(
        "UPDATE participant_stats SET currency_balance = currency_balance - ?2
         WHERE participant_id = ?1",
        params![participant_id, amount],
    )?;
    Ok(changed(n))
}
