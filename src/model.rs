//! Domain records for competitions, registrations and participant stats.
//!
//! JSON columns (`winners`, `result_photos`, `score_history`) are decoded once
//! at the store boundary into the typed sequences below. Anything that fails to
//! decode is treated as empty rather than failing the read.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of winner positions awarded when a competition finishes.
pub const PODIUM_SIZE: usize = 3;

/// Default bound on a registration's score history.
pub const DEFAULT_HISTORY_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Registration,
    InProgress,
    Finished,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Registration => "REGISTRATION",
            Status::InProgress => "IN_PROGRESS",
            Status::Finished => "FINISHED",
            Status::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REGISTRATION" => Ok(Status::Registration),
            "IN_PROGRESS" => Ok(Status::InProgress),
            "FINISHED" => Ok(Status::Finished),
            "CANCELLED" => Ok(Status::Cancelled),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// One podium entry. `award` is the currency amount credited to the
/// participant; it starts at zero and is set later by the award collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerRecord {
    pub position: u8,
    pub participant_id: String,
    #[serde(default)]
    pub award: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Competition {
    pub id: String,
    pub name: String,
    pub status: Status,
    pub scheduled_start: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub auto_started: bool,
    pub winners: Vec<WinnerRecord>,
    pub result_photos: Vec<String>,
}

impl Competition {
    pub fn winner_at(&self, position: u8) -> Option<&WinnerRecord> {
        self.winners.iter().find(|w| w.position == position)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub previous_score: f64,
    /// Epoch milliseconds of the edit.
    pub ts: i64,
}

/// Bounded undo history, oldest entry first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScoreHistory {
    entries: VecDeque<ScoreEntry>,
}

impl ScoreHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an entry, evicting from the front until at most `cap` remain.
    /// Returns how many entries were evicted.
    pub fn push(&mut self, entry: ScoreEntry, cap: usize) -> usize {
        self.entries.push_back(entry);
        let mut evicted = 0;
        while self.entries.len() > cap.max(1) {
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn pop(&mut self) -> Option<ScoreEntry> {
        self.entries.pop_back()
    }

    pub fn last(&self) -> Option<&ScoreEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoreEntry> {
        self.entries.iter()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "[]".to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub participant_id: String,
    pub competition_id: String,
    pub score: f64,
    pub history: ScoreHistory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantStats {
    pub participant_id: String,
    pub matches_played: u32,
    pub wins: u32,
    pub wins_first: u32,
    pub wins_second: u32,
    pub wins_third: u32,
    pub currency_balance: i64,
}

pub fn parse_winners(raw: Option<&str>) -> Vec<WinnerRecord> {
    raw.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

pub fn parse_photos(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

pub fn parse_history(raw: Option<&str>) -> ScoreHistory {
    raw.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

pub fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}
