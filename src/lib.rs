//! Tournament lifecycle engine.
//!
//! Advances competitions through `REGISTRATION -> IN_PROGRESS -> FINISHED`
//! (with cancellation and a correction path back out of `FINISHED`), applies or
//! reverts participant stats alongside each transition, and keeps a per
//! registration score ledger with bounded undo.
//!
//! ```text
//!   Operator ──┐
//!              ├──► Lifecycle ──► Stats ──┐
//!   Scheduler ─┘        │                 ├──► Store (SQLite)
//!                       └─────────────────┘
//!   Operator ─────► ScoreLedger ──────────────► Store
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod operator;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::EngineError;
pub use ledger::{BulkReport, RedoStack, ScoreChange, ScoreLedger, ScoreUpdate, UndoOutcome};
pub use lifecycle::{EffectOutcome, Lifecycle, SideEffect, TransitionReport};
pub use model::{Competition, ParticipantStats, Registration, Status, WinnerRecord};
pub use operator::{OpResult, Operator};
pub use scheduler::{Scheduler, SchedulerHandle, SweepReport};
pub use stats::StatsOp;
pub use store::{NewCompetition, Store};
