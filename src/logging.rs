//! Structured JSON-line logging for the tournament engine.
//!
//! Every record carries a run id, a monotonic sequence number, a level and a
//! domain so that a run can be filtered and replayed from its log alone.
//! Records go to stdout; when `LOG_DIR` is set they are also appended to
//! `<LOG_DIR>/<run_id>/events.jsonl`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::model::{Status, WinnerRecord};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Lifecycle, // Status transitions, winners
    Stats,     // Participant stats side effects
    Ledger,    // Score edits and undo
    Scheduler, // Timer sweeps
    Store,     // Schema, transactions
    System,    // Startup, shutdown
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Lifecycle => "lifecycle",
            Domain::Stats => "stats",
            Domain::Ledger => "ledger",
            Domain::Scheduler => "scheduler",
            Domain::Store => "store",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<std::fs::File>>>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let events = std::env::var("LOG_DIR").ok().and_then(|base| {
            let mut run_dir = PathBuf::from(base);
            run_dir.push(&run_id);
            if let Err(err) = create_dir_all(&run_dir) {
                eprintln!("[log] failed to create run dir: {}", err);
                return None;
            }
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(run_dir.join("events.jsonl"))
            {
                Ok(f) => Some(Mutex::new(BufWriter::new(f))),
                Err(err) => {
                    eprintln!("[log] failed to open events log: {}", err);
                    None
                }
            }
        });
        RunContext { run_id, events }
    })
}

pub fn run_id() -> &'static str {
    &ensure_run_context().run_id
}

pub fn flush() {
    if let Some(events) = &ensure_run_context().events {
        if let Ok(mut w) = events.lock() {
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    let line = render(level, domain, event, fields);
    let ctx = ensure_run_context();
    if let Some(events) = &ctx.events {
        if let Ok(mut w) = events.lock() {
            let _ = writeln!(w, "{}", line);
        }
    }
    println!("{}", line);
}

fn render(level: Level, domain: Domain, event: &str, mut fields: Map<String, Value>) -> String {
    let ctx = ensure_run_context();
    let msg = fields.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(domain.as_str()));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for key in ["competition_id", "participant_id"] {
        if let Some(value) = fields.remove(key) {
            entry.insert(key.to_string(), value);
        }
    }
    entry.insert("data".to_string(), Value::Object(fields));
    Value::Object(entry).to_string()
}

// =============================================================================
// Domain helpers
// =============================================================================

pub fn log_transition(competition_id: &str, from: Status, to: Status, winners: &[WinnerRecord], skipped: usize) {
    let winners: Vec<Value> = winners
        .iter()
        .map(|w| json!({"position": w.position, "participant_id": w.participant_id, "award": w.award}))
        .collect();
    log(
        Level::Info,
        Domain::Lifecycle,
        "transition",
        obj(&[
            ("competition_id", v_str(competition_id)),
            ("from", v_str(from.as_str())),
            ("to", v_str(to.as_str())),
            ("winners", Value::Array(winners)),
            ("skipped_effects", json!(skipped)),
        ]),
    );
}

pub fn log_side_effect_skipped(competition_id: &str, participant_id: &str, op: &str, reason: &str) {
    log(
        Level::Warn,
        Domain::Stats,
        "side_effect_skipped",
        obj(&[
            ("competition_id", v_str(competition_id)),
            ("participant_id", v_str(participant_id)),
            ("op", v_str(op)),
            ("msg", v_str(reason)),
        ]),
    );
}

pub fn log_score_change(competition_id: &str, participant_id: &str, event: &str, from: f64, to: f64, depth: usize) {
    log(
        Level::Debug,
        Domain::Ledger,
        event,
        obj(&[
            ("competition_id", v_str(competition_id)),
            ("participant_id", v_str(participant_id)),
            ("from", v_num(from)),
            ("to", v_num(to)),
            ("history_depth", json!(depth)),
        ]),
    );
}

pub fn log_sweep(sweep: &str, selected: usize, changed: usize, failed: usize) {
    let level = if failed > 0 { Level::Warn } else { Level::Debug };
    log(
        level,
        Domain::Scheduler,
        "sweep",
        obj(&[
            ("sweep", v_str(sweep)),
            ("selected", json!(selected)),
            ("changed", json!(changed)),
            ("failed", json!(failed)),
        ]),
    );
}

pub fn log_error(domain: Domain, event: &str, competition_id: Option<&str>, err: &dyn std::fmt::Display) {
    log(
        Level::Error,
        domain,
        event,
        obj(&[
            ("competition_id", competition_id.map(v_str).unwrap_or(Value::Null)),
            ("msg", v_str(&err.to_string())),
        ]),
    );
}

// =============================================================================
// Field helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}
