//! Background sweeps that start due competitions and finish overdue ones.
//!
//! The scheduler owns no state beyond its collaborators. It is spawned once by
//! the composition root and stopped through its [`SchedulerHandle`]. Both sweeps
//! go through the same [`Lifecycle`] entry points as operator transitions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::EngineError;
use crate::lifecycle::{Lifecycle, TransitionReport};
use crate::logging::{log, log_error, log_sweep, obj, Domain, Level};
use crate::retry::{retry_async, RetryConfig};
use crate::store::{due_for_finish, due_for_start};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub started: Vec<String>,
    pub finished: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        self.started.is_empty() && self.finished.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Start,
    Finish,
}

impl Sweep {
    fn name(&self) -> &'static str {
        match self {
            Sweep::Start => "auto_start",
            Sweep::Finish => "auto_finish",
        }
    }
}

pub struct Scheduler {
    lifecycle: Arc<Lifecycle>,
    clock: Arc<dyn Clock>,
    tick: std::time::Duration,
    auto_finish_after: chrono::Duration,
    retry: RetryConfig,
}

impl Scheduler {
    pub fn new(lifecycle: Arc<Lifecycle>, clock: Arc<dyn Clock>, cfg: &Config) -> Self {
        Self {
            lifecycle,
            clock,
            tick: cfg.tick(),
            auto_finish_after: cfg.auto_finish_after(),
            retry: RetryConfig::from_config(cfg),
        }
    }

    /// Run both sweeps once against `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        self.run_sweep(Sweep::Start, now, &mut report).await;
        self.run_sweep(Sweep::Finish, now, &mut report).await;
        report
    }

    async fn run_sweep(&self, sweep: Sweep, now: DateTime<Utc>, report: &mut SweepReport) {
        let cutoff = now - self.auto_finish_after;
        let lifecycle = self.lifecycle.clone();
        let selected = blocking(move || {
            lifecycle.store().read(|conn| match sweep {
                Sweep::Start => due_for_start(conn, now),
                Sweep::Finish => due_for_finish(conn, cutoff),
            })
        })
        .await;
        let ids = match selected {
            Ok(ids) => ids,
            Err(err) => {
                log_error(Domain::Scheduler, sweep.name(), None, &err);
                report.failed.push(("*".to_string(), err.to_string()));
                return;
            }
        };

        let mut changed = 0;
        let mut failed = 0;
        for id in &ids {
            let res: Result<TransitionReport, EngineError> =
                retry_async(&self.retry, sweep.name(), EngineError::is_transient, || {
                    let lifecycle = self.lifecycle.clone();
                    let id = id.clone();
                    blocking(move || match sweep {
                        Sweep::Start => lifecycle.auto_start(&id, now),
                        Sweep::Finish => lifecycle.auto_finish(&id, now, cutoff),
                    })
                })
                .await;
            match res {
                Ok(r) if r.changed => {
                    changed += 1;
                    match sweep {
                        Sweep::Start => report.started.push(id.clone()),
                        Sweep::Finish => report.finished.push(id.clone()),
                    }
                }
                Ok(_) => report.unchanged.push(id.clone()),
                Err(err) => {
                    failed += 1;
                    log_error(Domain::Scheduler, sweep.name(), Some(id.as_str()), &err);
                    report.failed.push((id.clone(), err.to_string()));
                }
            }
        }
        log_sweep(sweep.name(), ids.len(), changed, failed);
    }

    /// Sweep immediately, then on every tick until `shutdown` flips to true
    /// or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log(
            Level::Info,
            Domain::Scheduler,
            "started",
            obj(&[
                ("tick_secs", serde_json::json!(self.tick.as_secs())),
                ("auto_finish_secs", serde_json::json!(self.auto_finish_after.num_seconds())),
            ]),
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep(self.clock.now()).await;
                    if !report.is_idle() {
                        log(
                            Level::Info,
                            Domain::Scheduler,
                            "tick",
                            obj(&[
                                ("started", serde_json::json!(report.started)),
                                ("finished", serde_json::json!(report.finished)),
                                ("failed", serde_json::json!(report.failed.len())),
                            ]),
                        );
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log(Level::Info, Domain::Scheduler, "stopped", obj(&[]));
    }

    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        SchedulerHandle { shutdown: tx, task }
    }
}

/// Runs a synchronous store call on tokio's blocking pool. A busy database can
/// hold a call for the whole busy timeout.
async fn blocking<T, F>(f: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            log_error(Domain::Scheduler, "join", None, &err);
        }
    }
}
