use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use tourney::clock::{Clock, SystemClock};
use tourney::config::Config;
use tourney::ledger::ScoreLedger;
use tourney::lifecycle::Lifecycle;
use tourney::logging::{self, log, obj, v_str, Domain, Level};
use tourney::model::Status;
use tourney::operator::{OpResult, Operator};
use tourney::scheduler::Scheduler;
use tourney::store::{log_store_open, Store};

const USAGE: &str = "usage:
  tourney run
  tourney sweep
  tourney transition <competition> <status>
  tourney score <participant> <competition> <score>
  tourney undo <participant> <competition>";

struct App {
    lifecycle: Arc<Lifecycle>,
    ledger: Arc<ScoreLedger>,
    clock: Arc<dyn Clock>,
    cfg: Config,
}

impl App {
    fn build(cfg: Config) -> Result<Self> {
        let store = Store::open(&cfg.sqlite_path, cfg.busy_timeout())?;
        store.init()?;
        log_store_open(&cfg.sqlite_path);
        let store = Arc::new(store);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Ok(Self {
            lifecycle: Arc::new(Lifecycle::new(store.clone(), clock.clone())),
            ledger: Arc::new(ScoreLedger::new(store, clock.clone(), cfg.history_cap)),
            clock,
            cfg,
        })
    }

    fn scheduler(&self) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(self.lifecycle.clone(), self.clock.clone(), &self.cfg))
    }

    fn operator(&self) -> Operator {
        Operator::new(self.lifecycle.clone(), self.ledger.clone())
    }
}

fn print_result(res: &OpResult) -> Result<()> {
    println!("{}", serde_json::to_string(res)?);
    if res.success {
        Ok(())
    } else {
        Err(anyhow!(res.message.clone()))
    }
}

fn arg<'a>(args: &'a [String], i: usize) -> Result<&'a str> {
    args.get(i).map(String::as_str).ok_or_else(|| anyhow!("{}", USAGE))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let app = App::build(Config::from_env())?;

    let outcome = match args.first().map(String::as_str) {
        None | Some("run") => run(&app).await,
        Some("sweep") => {
            let report = app.scheduler().sweep(app.clock.now()).await;
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }
        Some("transition") => {
            let status: Status = arg(&args, 2)?.parse().map_err(|e: String| anyhow!(e))?;
            print_result(&app.operator().transition(arg(&args, 1)?, status))
        }
        Some("score") => {
            let score: f64 = arg(&args, 3)?.parse()?;
            print_result(&app.operator().set_score(arg(&args, 1)?, arg(&args, 2)?, score))
        }
        Some("undo") => print_result(&app.operator().undo_last(arg(&args, 1)?, arg(&args, 2)?)),
        Some(other) => bail!("unknown command {}\n{}", other, USAGE),
    };
    logging::flush();
    outcome
}

async fn run(app: &App) -> Result<()> {
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[("run_id", v_str(logging::run_id())), ("db", v_str(&app.cfg.sqlite_path))]),
    );
    let handle = app.scheduler().spawn();
    tokio::signal::ctrl_c().await?;
    log(Level::Info, Domain::System, "shutdown", obj(&[("msg", v_str("ctrl-c received"))]));
    handle.shutdown().await;
    Ok(())
}
