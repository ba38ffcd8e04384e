#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use factbridge_core::{Command, OutputDelta, Polarity, TableId, Value};
use factbridge_txn::{spawn_scheduler, Engine, EngineError, Program, SchedulerConfig, TableRegistry};
use tokio::sync::watch;
use tokio::time::Instant;

const IN: TableId = TableId(1);
const OUT: TableId = TableId(2);

#[derive(Default)]
struct Log {
    committed: Vec<(Vec<Command>, Instant)>,
    rollbacks: usize,
    pending: Vec<Command>,
}

/// Records transactions and emits a canned delta list on every commit.
struct StubEngine {
    log: Arc<Mutex<Log>>,
    emit: Vec<OutputDelta>,
    fail_next_apply: bool,
}

impl StubEngine {
    fn new(log: Arc<Mutex<Log>>) -> Self { Self { log, emit: Vec::new(), fail_next_apply: false } }
}

impl Engine for StubEngine {
    fn table_id(&self, name: &str) -> Result<TableId, EngineError> {
        match name {
            "stub.In" => Ok(IN),
            "stub.Out" => Ok(OUT),
            other => Err(EngineError::UnknownTable(other.to_string())),
        }
    }

    fn table_name(&self, id: TableId) -> Result<String, EngineError> {
        match id {
            IN => Ok("stub.In".into()),
            OUT => Ok("stub.Out".into()),
            other => Err(EngineError::UnknownTableId(other)),
        }
    }

    fn start_transaction(&mut self) -> Result<(), EngineError> { Ok(()) }

    fn apply_commands(&mut self, cmds: Vec<Command>) -> Result<(), EngineError> {
        if self.fail_next_apply {
            self.fail_next_apply = false;
            return Err(EngineError::Status { op: "apply", code: -1 });
        }
        self.log.lock().unwrap().pending.extend(cmds);
        Ok(())
    }

    fn commit_transaction(&mut self, on_delta: &mut dyn FnMut(OutputDelta)) -> Result<(), EngineError> {
        {
            let mut log = self.log.lock().unwrap();
            let cmds = std::mem::take(&mut log.pending);
            log.committed.push((cmds, Instant::now()));
        }
        for d in self.emit.iter().cloned() {
            on_delta(d);
        }
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<(), EngineError> {
        let mut log = self.log.lock().unwrap();
        log.pending.clear();
        log.rollbacks += 1;
        Ok(())
    }
}

type Seen = Arc<Mutex<Vec<(String, Polarity, Value)>>>;

fn program(engine: StubEngine) -> (Program<StubEngine>, Seen) {
    let reg = TableRegistry::resolve(&engine, &["stub.In", "stub.Out"]).unwrap();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = move |t: &str, d: OutputDelta| sink.lock().unwrap().push((t.to_string(), d.polarity, d.value));
    (Program::new(engine, reg, Box::new(handler)), seen)
}

fn cmd(i: u32) -> Command { Command::insert(IN, Value::u32(i)) }

#[tokio::test(start_paused = true)]
async fn full_batch_commits_without_waiting() {
    let log = Arc::new(Mutex::new(Log::default()));
    let (prog, _) = program(StubEngine::new(log.clone()));
    let (_stop, shutdown) = watch::channel(false);
    let (tx, handle) = spawn_scheduler(prog, SchedulerConfig::default(), shutdown);

    let t0 = Instant::now();
    for i in 0..32 {
        tx.send(cmd(i)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    {
        let log = log.lock().unwrap();
        assert_eq!(log.committed.len(), 1);
        assert_eq!(log.committed[0].0.len(), 32);
        assert!(log.committed[0].1 - t0 < Duration::from_millis(100));
        // commands arrive in send order
        assert_eq!(log.committed[0].0[31], cmd(31));
    }
    drop(tx);
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn partial_batch_commits_after_timeout() {
    let log = Arc::new(Mutex::new(Log::default()));
    let (prog, _) = program(StubEngine::new(log.clone()));
    let (_stop, shutdown) = watch::channel(false);
    let (tx, handle) = spawn_scheduler(prog, SchedulerConfig::default(), shutdown);

    let t0 = Instant::now();
    tx.send(cmd(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.lock().unwrap().committed.is_empty());
    tx.send(cmd(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    {
        let log = log.lock().unwrap();
        assert_eq!(log.committed.len(), 1);
        let (cmds, at) = &log.committed[0];
        assert_eq!(cmds.len(), 2);
        // deadline is measured from the first pending command
        let waited = *at - t0;
        assert!(waited >= Duration::from_millis(100) && waited < Duration::from_millis(110), "{:?}", waited);
    }
    drop(tx);
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn single_command_commits_at_deadline() {
    let log = Arc::new(Mutex::new(Log::default()));
    let (prog, _) = program(StubEngine::new(log.clone()));
    let (_stop, shutdown) = watch::channel(false);
    let (tx, handle) = spawn_scheduler(prog, SchedulerConfig::default(), shutdown);

    let t0 = Instant::now();
    tx.send(cmd(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    {
        let log = log.lock().unwrap();
        assert_eq!(log.committed.len(), 1);
        let (cmds, at) = &log.committed[0];
        assert_eq!(cmds, &vec![cmd(1)]);
        let waited = *at - t0;
        assert!(waited >= Duration::from_millis(100) && waited < Duration::from_millis(110), "{:?}", waited);
    }
    drop(tx);
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn busy_channel_does_not_hold_back_the_deadline() {
    let log = Arc::new(Mutex::new(Log::default()));
    let (prog, _) = program(StubEngine::new(log.clone()));
    let (_stop, shutdown) = watch::channel(false);
    let cfg = SchedulerConfig { batch_size: 1000, queue_capacity: 1000, ..SchedulerConfig::default() };
    let (tx, handle) = spawn_scheduler(prog, cfg, shutdown);

    let t0 = Instant::now();
    tx.send(cmd(0)).await.unwrap();
    tokio::task::yield_now().await;
    // the deadline passes while more commands sit in the channel
    for i in 1..6 {
        tx.try_send(cmd(i)).unwrap();
    }
    tokio::time::advance(Duration::from_millis(100)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    {
        let log = log.lock().unwrap();
        let (first, at) = &log.committed[0];
        assert_eq!(*at - t0, Duration::from_millis(100));
        assert_eq!(first[0], cmd(0));
        assert!(first.len() < 6, "expired batch waited for the channel to drain: {}", first.len());
        let all: Vec<Command> = log.committed.iter().flat_map(|(c, _)| c.iter().cloned()).collect();
        assert_eq!(all, (0..6).map(cmd).collect::<Vec<_>>());
    }
    drop(tx);
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn overflow_splits_into_size_and_timer_commits() {
    let log = Arc::new(Mutex::new(Log::default()));
    let (prog, _) = program(StubEngine::new(log.clone()));
    let (_stop, shutdown) = watch::channel(false);
    let (tx, handle) = spawn_scheduler(prog, SchedulerConfig::default(), shutdown);

    for i in 0..40 {
        tx.send(cmd(i)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    {
        let log = log.lock().unwrap();
        let sizes: Vec<usize> = log.committed.iter().map(|(c, _)| c.len()).collect();
        assert_eq!(sizes, vec![32, 8]);
    }
    drop(tx);
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn synchronous_mode_commits_each_command() {
    let log = Arc::new(Mutex::new(Log::default()));
    let (prog, _) = program(StubEngine::new(log.clone()));
    let (_stop, shutdown) = watch::channel(false);
    let (tx, handle) = spawn_scheduler(prog, SchedulerConfig::synchronous(), shutdown);

    for i in 0..3 {
        tx.send(cmd(i)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
    let sizes: Vec<usize> = log.lock().unwrap().committed.iter().map(|(c, _)| c.len()).collect();
    assert_eq!(sizes, vec![1, 1, 1]);
    drop(tx);
    handle.await.unwrap();
}

#[tokio::test]
async fn deltas_are_delivered_in_engine_order() {
    let log = Arc::new(Mutex::new(Log::default()));
    let mut engine = StubEngine::new(log);
    engine.emit = vec![
        OutputDelta { table: OUT, value: Value::string("a"), polarity: Polarity::Insert },
        OutputDelta { table: OUT, value: Value::string("b"), polarity: Polarity::Delete },
        OutputDelta { table: IN, value: Value::string("c"), polarity: Polarity::Insert },
    ];
    let (prog, seen) = program(engine);
    let (_stop, shutdown) = watch::channel(false);
    let (tx, handle) = spawn_scheduler(prog, SchedulerConfig::synchronous(), shutdown);
    tx.send(cmd(0)).await.unwrap();
    drop(tx);
    handle.await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen.as_slice(),
        &[
            ("stub.Out".to_string(), Polarity::Insert, Value::string("a")),
            ("stub.Out".to_string(), Polarity::Delete, Value::string("b")),
            ("stub.In".to_string(), Polarity::Insert, Value::string("c")),
        ]
    );
}

#[tokio::test]
async fn engine_error_drops_batch_and_continues() {
    let log = Arc::new(Mutex::new(Log::default()));
    let mut engine = StubEngine::new(log.clone());
    engine.fail_next_apply = true;
    let (prog, _) = program(engine);
    let (_stop, shutdown) = watch::channel(false);
    let (tx, handle) = spawn_scheduler(prog, SchedulerConfig::synchronous(), shutdown);
    tx.send(cmd(1)).await.unwrap();
    tx.send(cmd(2)).await.unwrap();
    drop(tx);
    handle.await.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.rollbacks, 1);
    assert_eq!(log.committed.len(), 1);
    assert_eq!(log.committed[0].0, vec![cmd(2)]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_discards_pending_batch() {
    let log = Arc::new(Mutex::new(Log::default()));
    let (prog, _) = program(StubEngine::new(log.clone()));
    let (stop, shutdown) = watch::channel(false);
    let (tx, handle) = spawn_scheduler(prog, SchedulerConfig::default(), shutdown);
    tx.send(cmd(1)).await.unwrap();
    tokio::task::yield_now().await;
    stop.send(true).unwrap();
    handle.await.unwrap();
    assert!(log.lock().unwrap().committed.is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_when_configured() {
    let log = Arc::new(Mutex::new(Log::default()));
    let (prog, _) = program(StubEngine::new(log.clone()));
    let (stop, shutdown) = watch::channel(false);
    let cfg = SchedulerConfig { flush_on_shutdown: true, ..SchedulerConfig::default() };
    let (tx, handle) = spawn_scheduler(prog, cfg, shutdown);
    tx.send(cmd(1)).await.unwrap();
    tokio::task::yield_now().await;
    stop.send(true).unwrap();
    handle.await.unwrap();
    assert_eq!(log.lock().unwrap().committed.len(), 1);
}

#[tokio::test]
async fn closing_the_channel_commits_and_returns_the_program() {
    let log = Arc::new(Mutex::new(Log::default()));
    let (prog, _) = program(StubEngine::new(log.clone()));
    let (_stop, shutdown) = watch::channel(false);
    let (tx, handle) = spawn_scheduler(prog, SchedulerConfig::default(), shutdown);
    tx.send(cmd(7)).await.unwrap();
    drop(tx);
    let prog = handle.await.unwrap();
    assert_eq!(prog.tables().len(), 2);
    assert_eq!(log.lock().unwrap().committed[0].0, vec![cmd(7)]);
}

#[test]
fn config_defaults() {
    let cfg = SchedulerConfig::default();
    assert_eq!(cfg.batch_size, 32);
    assert_eq!(cfg.batch_timeout, Duration::from_millis(100));
    assert_eq!(cfg.queue_capacity, 32);
    assert!(!cfg.flush_on_shutdown);
    assert_eq!(SchedulerConfig::synchronous().batch_size, 1);
}

#[test]
fn config_from_env_overrides_defaults() {
    std::env::set_var("FACTBRIDGE_BATCH_SIZE", "64");
    std::env::set_var("FACTBRIDGE_BATCH_TIMEOUT_MS", "250");
    std::env::set_var("FACTBRIDGE_QUEUE_CAP", "0");
    std::env::set_var("FACTBRIDGE_FLUSH_ON_SHUTDOWN", "yes");
    let cfg = SchedulerConfig::from_env();
    for var in ["FACTBRIDGE_BATCH_SIZE", "FACTBRIDGE_BATCH_TIMEOUT_MS", "FACTBRIDGE_QUEUE_CAP", "FACTBRIDGE_FLUSH_ON_SHUTDOWN"] {
        std::env::remove_var(var);
    }
    assert_eq!(cfg.batch_size, 64);
    assert_eq!(cfg.batch_timeout, Duration::from_millis(250));
    // zero capacity is rejected in favour of the default
    assert_eq!(cfg.queue_capacity, 32);
    assert!(cfg.flush_on_shutdown);
}
