//! SQLite-backed durable store.
//!
//! The connection lives behind a mutex and every write path runs inside a
//! `BEGIN IMMEDIATE` transaction, so two callers touching the same competition
//! are serialized. Status changes are additionally compare-and-swap on the
//! prior status, which catches writers from other processes sharing the file.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use crate::clock::{from_millis, to_millis};
use crate::error::EngineError;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::{
    parse_history, parse_photos, parse_winners, to_json, Competition, ParticipantStats,
    Registration, Status, WinnerRecord,
};

const SCHEMA: &str = "BEGIN;
    CREATE TABLE IF NOT EXISTS participants (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS competitions (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        scheduled_start INTEGER NOT NULL,
        started_at INTEGER,
        auto_started INTEGER NOT NULL DEFAULT 0,
        winners TEXT NOT NULL DEFAULT '[]',
        result_photos TEXT NOT NULL DEFAULT '[]'
    );
    CREATE TABLE IF NOT EXISTS registrations (
        participant_id TEXT NOT NULL,
        competition_id TEXT NOT NULL,
        score REAL NOT NULL DEFAULT 0,
        score_history TEXT NOT NULL DEFAULT '[]',
        UNIQUE (participant_id, competition_id)
    );
    CREATE TABLE IF NOT EXISTS participant_stats (
        participant_id TEXT PRIMARY KEY,
        matches_played INTEGER NOT NULL DEFAULT 0,
        wins INTEGER NOT NULL DEFAULT 0,
        wins_first INTEGER NOT NULL DEFAULT 0,
        wins_second INTEGER NOT NULL DEFAULT 0,
        wins_third INTEGER NOT NULL DEFAULT 0,
        currency_balance INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_competitions_status ON competitions (status);
    CREATE INDEX IF NOT EXISTS idx_registrations_competition ON registrations (competition_id);
    COMMIT;";

const COMPETITION_COLUMNS: &str =
    "id, name, status, scheduled_start, started_at, auto_started, winners, result_photos";

#[derive(Debug, Clone)]
pub struct NewCompetition {
    pub id: String,
    pub name: String,
    pub scheduled_start: DateTime<Utc>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self, EngineError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        let store = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        store.init()?;
        Ok(store)
    }

    pub fn init(&self) -> Result<(), EngineError> {
        self.lock().execute_batch(SCHEMA)?;
        log(Level::Debug, Domain::Store, "schema_ready", obj(&[]));
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` inside one immediate transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn with_tx<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, EngineError>,
    {
        let mut conn = self.lock();
        let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&mut tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn read<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, EngineError>,
    {
        let conn = self.lock();
        f(&conn)
    }

    // -------------------------------------------------------------------------
    // Roster
    // -------------------------------------------------------------------------

    pub fn add_participant(&self, id: &str, name: &str) -> Result<(), EngineError> {
        self.lock().execute(
            "INSERT INTO participants (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![id, name],
        )?;
        Ok(())
    }

    /// Deletes the participant record, every registration it holds and its
    /// aggregate stats. Returns the number of registrations dropped.
    pub fn remove_participant(&self, id: &str) -> Result<usize, EngineError> {
        self.with_tx(|tx| {
            let n = tx.execute("DELETE FROM participants WHERE id = ?1", params![id])?;
            if n == 0 {
                return Err(EngineError::not_found("participant", id));
            }
            let dropped = tx.execute("DELETE FROM registrations WHERE participant_id = ?1", params![id])?;
            tx.execute("DELETE FROM participant_stats WHERE participant_id = ?1", params![id])?;
            Ok(dropped)
        })
    }

    pub fn create_competition(&self, new: &NewCompetition) -> Result<Competition, EngineError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO competitions (id, name, status, scheduled_start) VALUES (?1, ?2, ?3, ?4)",
                params![new.id, new.name, Status::Registration.as_str(), to_millis(new.scheduled_start)],
            )?;
            require_competition(tx, &new.id)
        })
    }

    pub fn register(&self, participant_id: &str, competition_id: &str) -> Result<Registration, EngineError> {
        self.with_tx(|tx| {
            require_competition(tx, competition_id)?;
            if !participant_exists(tx, participant_id)? {
                return Err(EngineError::not_found("participant", participant_id));
            }
            tx.execute(
                "INSERT OR IGNORE INTO registrations (participant_id, competition_id) VALUES (?1, ?2)",
                params![participant_id, competition_id],
            )?;
            require_registration(tx, participant_id, competition_id)
        })
    }

    pub fn withdraw(&self, participant_id: &str, competition_id: &str) -> Result<(), EngineError> {
        let n = self.lock().execute(
            "DELETE FROM registrations WHERE participant_id = ?1 AND competition_id = ?2",
            params![participant_id, competition_id],
        )?;
        if n == 0 {
            return Err(EngineError::not_found(
                "registration",
                format!("{}/{}", participant_id, competition_id),
            ));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn competition(&self, id: &str) -> Result<Competition, EngineError> {
        self.read(|conn| require_competition(conn, id))
    }

    pub fn registrations(&self, competition_id: &str) -> Result<Vec<Registration>, EngineError> {
        self.read(|conn| load_registrations(conn, competition_id))
    }

    pub fn registration(&self, participant_id: &str, competition_id: &str) -> Result<Registration, EngineError> {
        self.read(|conn| require_registration(conn, participant_id, competition_id))
    }

    pub fn stats(&self, participant_id: &str) -> Result<Option<ParticipantStats>, EngineError> {
        self.read(|conn| load_stats(conn, participant_id))
    }
}

// =============================================================================
// Row-level helpers (usable inside a transaction)
// =============================================================================

fn conversion_err(col: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, Type::Text, msg.into())
}

fn row_to_competition(row: &Row<'_>) -> rusqlite::Result<Competition> {
    let status: String = row.get(2)?;
    let status = status.parse::<Status>().map_err(|e| conversion_err(2, e))?;
    let winners: Option<String> = row.get(6)?;
    let photos: Option<String> = row.get(7)?;
    Ok(Competition {
        id: row.get(0)?,
        name: row.get(1)?,
        status,
        scheduled_start: from_millis(row.get(3)?),
        started_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
        auto_started: row.get::<_, i64>(5)? != 0,
        winners: parse_winners(winners.as_deref()),
        result_photos: parse_photos(photos.as_deref()),
    })
}

fn row_to_registration(row: &Row<'_>) -> rusqlite::Result<Registration> {
    let history: Option<String> = row.get(3)?;
    Ok(Registration {
        participant_id: row.get(0)?,
        competition_id: row.get(1)?,
        score: row.get(2)?,
        history: parse_history(history.as_deref()),
    })
}

pub fn load_competition(conn: &Connection, id: &str) -> Result<Option<Competition>, EngineError> {
    let sql = format!("SELECT {} FROM competitions WHERE id = ?1", COMPETITION_COLUMNS);
    Ok(conn.query_row(&sql, params![id], row_to_competition).optional()?)
}

pub fn require_competition(conn: &Connection, id: &str) -> Result<Competition, EngineError> {
    load_competition(conn, id)?.ok_or_else(|| EngineError::not_found("competition", id))
}

/// Registrations in enrollment order.
pub fn load_registrations(conn: &Connection, competition_id: &str) -> Result<Vec<Registration>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT participant_id, competition_id, score, score_history
         FROM registrations WHERE competition_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt.query_map(params![competition_id], row_to_registration)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn load_registration(
    conn: &Connection,
    participant_id: &str,
    competition_id: &str,
) -> Result<Option<Registration>, EngineError> {
    Ok(conn
        .query_row(
            "SELECT participant_id, competition_id, score, score_history
             FROM registrations WHERE participant_id = ?1 AND competition_id = ?2",
            params![participant_id, competition_id],
            row_to_registration,
        )
        .optional()?)
}

pub fn require_registration(
    conn: &Connection,
    participant_id: &str,
    competition_id: &str,
) -> Result<Registration, EngineError> {
    load_registration(conn, participant_id, competition_id)?.ok_or_else(|| {
        EngineError::not_found("registration", format!("{}/{}", participant_id, competition_id))
    })
}

pub fn write_registration_score(conn: &Connection, reg: &Registration) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE registrations SET score = ?1, score_history = ?2
         WHERE participant_id = ?3 AND competition_id = ?4",
        params![reg.score, reg.history.to_json(), reg.participant_id, reg.competition_id],
    )?;
    Ok(())
}

pub fn participant_exists(conn: &Connection, id: &str) -> Result<bool, EngineError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM participants WHERE id = ?1", params![id], |r| r.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Compare-and-swap on status. Fails with `Conflict` if the row moved.
pub fn swap_status(conn: &Connection, id: &str, from: Status, to: Status) -> Result<(), EngineError> {
    let n = conn.execute(
        "UPDATE competitions SET status = ?1 WHERE id = ?2 AND status = ?3",
        params![to.as_str(), id, from.as_str()],
    )?;
    if n == 0 {
        return Err(EngineError::Conflict { competition_id: id.to_string() });
    }
    Ok(())
}

pub fn write_winners(conn: &Connection, id: &str, winners: &[WinnerRecord]) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE competitions SET winners = ?1 WHERE id = ?2",
        params![to_json(&winners), id],
    )?;
    Ok(())
}

pub fn write_result_photos(conn: &Connection, id: &str, photos: &[String]) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE competitions SET result_photos = ?1 WHERE id = ?2",
        params![to_json(&photos), id],
    )?;
    Ok(())
}

/// Sets `started_at` only if it was never set; optionally latches `auto_started`.
pub fn mark_started(conn: &Connection, id: &str, now: DateTime<Utc>, auto: bool) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE competitions
         SET started_at = COALESCE(started_at, ?1),
             auto_started = CASE WHEN ?2 THEN 1 ELSE auto_started END
         WHERE id = ?3",
        params![to_millis(now), auto, id],
    )?;
    Ok(())
}

pub fn due_for_start(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM competitions
         WHERE status = ?1 AND scheduled_start <= ?2 AND auto_started = 0
         ORDER BY scheduled_start, id",
    )?;
    let rows = stmt.query_map(params![Status::Registration.as_str(), to_millis(now)], |r| r.get(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn due_for_finish(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM competitions
         WHERE status = ?1 AND started_at IS NOT NULL AND started_at <= ?2
         ORDER BY started_at, id",
    )?;
    let rows = stmt.query_map(params![Status::InProgress.as_str(), to_millis(cutoff)], |r| r.get(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn load_stats(conn: &Connection, participant_id: &str) -> Result<Option<ParticipantStats>, EngineError> {
    Ok(conn
        .query_row(
            "SELECT participant_id, matches_played, wins, wins_first, wins_second, wins_third, currency_balance
             FROM participant_stats WHERE participant_id = ?1",
            params![participant_id],
            |r| {
                Ok(ParticipantStats {
                    participant_id: r.get(0)?,
                    matches_played: r.get(1)?,
                    wins: r.get(2)?,
                    wins_first: r.get(3)?,
                    wins_second: r.get(4)?,
                    wins_third: r.get(5)?,
                    currency_balance: r.get(6)?,
                })
            },
        )
        .optional()?)
}

pub fn log_store_open(path: &str) {
    log(Level::Info, Domain::Store, "open", obj(&[("path", v_str(path))]));
}
