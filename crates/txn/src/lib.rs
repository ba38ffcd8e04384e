//! factbridge transaction scheduler.
//!
//! Many producers hand [`Command`]s to one scheduler task that owns the
//! engine. Commands are grouped into transactions by count or by age of the
//! oldest pending command, whichever trips first.

#![forbid(unsafe_code)]

use std::time::Duration;

use factbridge_core::Command;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub mod engine;
pub mod memory;
pub mod output;
pub mod program;
pub mod record;

pub use engine::{Engine, EngineError, TableRegistry};
pub use memory::MemEngine;
pub use output::{ChangeDumper, DiscardSink, DumpFormat, OutputHandler};
pub use program::{BatchOutcome, Program, TxnError};
pub use record::CommandRecorder;

pub type CommandSender = mpsc::Sender<Command>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Commit as soon as this many commands are pending. `1` commits every command on its own.
    pub batch_size: usize,
    /// Commit once the oldest pending command has waited this long.
    pub batch_timeout: Duration,
    /// Producers block while this many commands are queued.
    pub queue_capacity: usize,
    /// Commit, rather than discard, the pending batch on shutdown.
    pub flush_on_shutdown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { batch_size: 32, batch_timeout: Duration::from_millis(100), queue_capacity: 32, flush_on_shutdown: false }
    }
}

impl SchedulerConfig {
    pub fn synchronous() -> Self { Self { batch_size: 1, ..Self::default() } }

    /// Defaults overridden by `FACTBRIDGE_BATCH_SIZE`, `FACTBRIDGE_BATCH_TIMEOUT_MS`,
    /// `FACTBRIDGE_QUEUE_CAP` and `FACTBRIDGE_FLUSH_ON_SHUTDOWN`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let batch_size = std::env::var("FACTBRIDGE_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(d.batch_size);
        let batch_timeout = std::env::var("FACTBRIDGE_BATCH_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.batch_timeout);
        let queue_capacity = std::env::var("FACTBRIDGE_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(d.queue_capacity);
        let flush_on_shutdown = std::env::var("FACTBRIDGE_FLUSH_ON_SHUTDOWN")
            .ok()
            .map(|s| matches!(s.as_str(), "1" | "true" | "yes"))
            .unwrap_or(d.flush_on_shutdown);
        Self { batch_size, batch_timeout, queue_capacity, flush_on_shutdown }
    }
}

/// Spawn the scheduler task. The task ends when `shutdown` flips to `true`
/// or when every sender is dropped, and hands the program back.
pub fn spawn_scheduler<E: Engine + 'static>(
    program: Program<E>,
    cfg: SchedulerConfig,
    shutdown: watch::Receiver<bool>,
) -> (CommandSender, JoinHandle<Program<E>>) {
    let (tx, rx) = mpsc::channel::<Command>(cfg.queue_capacity.max(1));
    let handle = tokio::spawn(run_scheduler(program, cfg, rx, shutdown));
    (tx, handle)
}

pub async fn run_scheduler<E: Engine>(
    mut program: Program<E>,
    cfg: SchedulerConfig,
    mut rx: mpsc::Receiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) -> Program<E> {
    let batch_size = cfg.batch_size.max(1);
    let mut batch: Vec<Command> = Vec::with_capacity(batch_size);
    let timer = tokio::time::sleep(cfg.batch_timeout);
    tokio::pin!(timer);
    let mut armed = false;
    let mut shutdown_open = true;
    info!(batch_size, timeout_ms = cfg.batch_timeout.as_millis() as u64, "transaction scheduler started");

    if *shutdown.borrow() {
        info!("transaction scheduler stopped before start");
        return program;
    }

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed(), if shutdown_open => {
                if changed.is_err() {
                    // signal sender gone; only channel close can stop us now
                    shutdown_open = false;
                    continue;
                }
                if !*shutdown.borrow() {
                    continue;
                }
                if cfg.flush_on_shutdown {
                    commit_pending(&mut program, &mut batch, "shutdown");
                } else if !batch.is_empty() {
                    warn!(discarded = batch.len(), "shutdown with uncommitted commands; discarding");
                    counter!("txn_discarded_total", batch.len() as u64);
                }
                break;
            }
            _ = &mut timer, if armed => {
                armed = false;
                commit_pending(&mut program, &mut batch, "timer");
            }
            maybe = rx.recv() => match maybe {
                Some(cmd) => {
                    if batch.is_empty() {
                        timer.as_mut().reset(Instant::now() + cfg.batch_timeout);
                        armed = true;
                    }
                    batch.push(cmd);
                    if batch.len() >= batch_size {
                        armed = false;
                        commit_pending(&mut program, &mut batch, "size");
                    } else if Instant::now() >= timer.deadline() {
                        // a channel that never runs dry must not hold back an expired batch
                        armed = false;
                        commit_pending(&mut program, &mut batch, "timer");
                    }
                }
                None => {
                    debug!("command channel closed; committing pending batch and exiting");
                    commit_pending(&mut program, &mut batch, "drain");
                    break;
                }
            },
        }
    }
    info!("transaction scheduler stopped");
    program
}

fn commit_pending<E: Engine>(program: &mut Program<E>, batch: &mut Vec<Command>, trigger: &'static str) {
    if batch.is_empty() {
        return;
    }
    let cmds = std::mem::replace(batch, Vec::with_capacity(batch.capacity()));
    let n = cmds.len();
    let started = std::time::Instant::now();
    match program.commit_batch(cmds) {
        Ok(outcome) => {
            let ms = started.elapsed().as_secs_f64() * 1000.0;
            debug!(trigger, commands = n, deltas = outcome.deltas, took_ms = %format!("{:.3}", ms), "transaction committed");
            counter!("txn_commits_total", 1u64);
            counter!("txn_commands_total", n as u64);
            counter!("txn_deltas_total", outcome.deltas as u64);
            histogram!("txn_batch_size", n as f64);
            histogram!("txn_commit_ms", ms);
        }
        Err(e) => {
            // the batch is lost; later batches still go through
            error!(trigger, commands = n, error = %e, "transaction failed; batch dropped");
            counter!("txn_errors_total", 1u64, "op" => e.op());
        }
    }
}
