use std::time::Duration;

use crate::model::DEFAULT_HISTORY_CAP;

#[derive(Debug, Clone)]
pub struct Config {
    pub sqlite_path: String,
    pub tick_secs: u64,
    pub auto_finish_secs: i64,
    pub history_cap: usize,
    pub busy_timeout_ms: u64,
    pub retry_max: u32,
    pub retry_base_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sqlite_path: "./tourney.sqlite".to_string(),
            tick_secs: 60,
            auto_finish_secs: 8 * 3600,
            history_cap: DEFAULT_HISTORY_CAP,
            busy_timeout_ms: 5000,
            retry_max: 3,
            retry_base_ms: 100,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            sqlite_path: std::env::var("TOURNEY_DB").unwrap_or(d.sqlite_path),
            tick_secs: std::env::var("SCHED_TICK_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.tick_secs),
            auto_finish_secs: std::env::var("AUTO_FINISH_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.auto_finish_secs),
            history_cap: std::env::var("SCORE_HISTORY_CAP").ok().and_then(|v| v.parse().ok()).filter(|c| *c > 0).unwrap_or(d.history_cap),
            busy_timeout_ms: std::env::var("STORE_BUSY_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.busy_timeout_ms),
            retry_max: std::env::var("RETRY_MAX").ok().and_then(|v| v.parse().ok()).unwrap_or(d.retry_max),
            retry_base_ms: std::env::var("RETRY_BASE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.retry_base_ms),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn auto_finish_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auto_finish_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
