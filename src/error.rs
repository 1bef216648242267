use rusqlite::ErrorCode;
use thiserror::Error;

use crate::model::Status;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("no score edit to undo")]
    EmptyHistory,

    #[error("cannot move competition from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("winner position {0} is outside the podium")]
    InvalidPosition(u8),

    #[error("score {0} is not a finite number")]
    InvalidScore(f64),

    #[error("award amount {0} must not be negative")]
    InvalidAward(i64),

    #[error("competition {competition_id} is {status}")]
    WrongStatus { competition_id: String, status: Status },

    #[error("competition {competition_id} status changed concurrently")]
    Conflict { competition_id: String },

    #[error("store failure: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound { kind, id: id.into() }
    }

    /// Busy/locked database errors clear up on their own and are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            _ => false,
        }
    }

    /// Errors that come from the store rather than the caller's request.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_transient() {
        let busy = EngineError::Store(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_transient());
        assert!(busy.is_store_failure());
        assert!(!EngineError::EmptyHistory.is_transient());
    }

    #[test]
    fn test_not_found_message() {
        let e = EngineError::not_found("competition", "c-9");
        assert_eq!(e.to_string(), "competition c-9 not found");
    }
}
