//! The single owner of an engine: transactions, output dispatch, recording.

use std::borrow::Cow;
use std::path::Path;

use factbridge_core::{Command, OutputDelta};
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::{Engine, EngineError, TableRegistry};
use crate::output::OutputHandler;
use crate::record::CommandRecorder;

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("engine {op} failed ({tables}): {source}")]
    Engine {
        op: &'static str,
        /// Tables touched by the failed batch, for the log line.
        tables: String,
        #[source]
        source: EngineError,
    },
    #[error("command recording: {0}")]
    Record(#[from] std::io::Error),
}

impl TxnError {
    /// Short label for metrics.
    pub fn op(&self) -> &'static str {
        match self {
            TxnError::Engine { op, .. } => op,
            TxnError::Record(_) => "record",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub commands: usize,
    pub deltas: usize,
}

pub struct Program<E: Engine> {
    engine: E,
    tables: TableRegistry,
    handler: Box<dyn OutputHandler>,
    recorder: Option<CommandRecorder>,
}

impl<E: Engine> Program<E> {
    pub fn new(engine: E, tables: TableRegistry, handler: Box<dyn OutputHandler>) -> Self {
        Self { engine, tables, handler, recorder: None }
    }

    pub fn tables(&self) -> &TableRegistry { &self.tables }
    pub fn engine(&self) -> &E { &self.engine }
    pub fn into_engine(self) -> E { self.engine }
    pub fn is_recording(&self) -> bool { self.recorder.is_some() }

    /// Record every subsequent transaction to `path`. A recording already in
    /// progress is closed first.
    pub fn start_recording(&mut self, path: impl AsRef<Path>) -> Result<(), TxnError> {
        self.stop_recording()?;
        let rec = CommandRecorder::create(path)?;
        info!(path = %rec.path().display(), "command recording started");
        self.recorder = Some(rec);
        Ok(())
    }

    pub fn stop_recording(&mut self) -> Result<(), TxnError> {
        if let Some(rec) = self.recorder.take() {
            let path = rec.path().display().to_string();
            rec.close()?;
            info!(%path, "command recording stopped");
        }
        Ok(())
    }

    /// Run one transaction: start, apply every command, commit.
    ///
    /// Output deltas reach the handler before this returns. If applying fails
    /// the transaction is rolled back and nothing from the batch is visible.
    pub fn commit_batch(&mut self, batch: Vec<Command>) -> Result<BatchOutcome, TxnError> {
        let commands = batch.len();
        let tables = self.summarize(&batch);
        self.engine
            .start_transaction()
            .map_err(|source| TxnError::Engine { op: "start", tables: tables.clone(), source })?;
        // only transactions the engine accepted go into the recording
        self.record(|rec, reg| {
            rec.record_start()?;
            rec.record_commands(reg, &batch)
        });

        if let Err(source) = self.engine.apply_commands(batch) {
            if let Err(rb) = self.engine.rollback_transaction() {
                warn!(error = %rb, "rollback after failed apply also failed");
            }
            self.record(|rec, _| rec.record_rollback());
            return Err(TxnError::Engine { op: "apply", tables, source });
        }

        let reg = &self.tables;
        let handler = &mut self.handler;
        let mut deltas = 0usize;
        let committed = self.engine.commit_transaction(&mut |d: OutputDelta| {
            deltas += 1;
            let name = match reg.name(d.table) {
                Some(n) => Cow::Borrowed(n),
                None => Cow::Owned(d.table.to_string()),
            };
            handler.handle(&name, d);
        });
        if let Err(source) = committed {
            if let Err(rb) = self.engine.rollback_transaction() {
                warn!(error = %rb, "rollback after failed commit also failed");
            }
            self.record(|rec, _| rec.record_rollback());
            return Err(TxnError::Engine { op: "commit", tables, source });
        }
        self.handler.flush();
        self.record(|rec, _| rec.record_commit());
        Ok(BatchOutcome { commands, deltas })
    }

    /// Recording is best effort; a failing recorder is dropped, not the batch.
    fn record(&mut self, f: impl FnOnce(&mut CommandRecorder, &TableRegistry) -> std::io::Result<()>) {
        let Some(rec) = self.recorder.as_mut() else { return };
        if let Err(e) = f(rec, &self.tables) {
            warn!(error = %e, path = %rec.path().display(), "command recording failed; recording stopped");
            self.recorder = None;
        }
    }

    fn summarize(&self, batch: &[Command]) -> String {
        let mut counts: Vec<(factbridge_core::TableId, usize)> = Vec::new();
        for cmd in batch {
            match counts.iter_mut().find(|(t, _)| *t == cmd.table) {
                Some((_, n)) => *n += 1,
                None => counts.push((cmd.table, 1)),
            }
        }
        counts
            .into_iter()
            .map(|(t, n)| match self.tables.name(t) {
                Some(name) => format!("{} x{}", name, n),
                None => format!("{} x{}", t, n),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemEngine;
    use factbridge_core::{Polarity, TableId, Value};
    use std::sync::{Arc, Mutex};

    fn program(seen: Arc<Mutex<Vec<(String, Polarity, Value)>>>) -> Program<MemEngine> {
        let eng = MemEngine::new().with_keyed_table("t.Kv", |v| v.as_tuple().ok().and_then(|t| t.first().cloned()));
        let reg = TableRegistry::resolve(&eng, &["t.Kv"]).unwrap();
        let handler = move |t: &str, d: OutputDelta| seen.lock().unwrap().push((t.to_string(), d.polarity, d.value));
        Program::new(eng, reg, Box::new(handler))
    }

    fn kv(k: &str, v: u32) -> Value { Value::pair(Value::string(k), Value::u32(v)) }

    fn tmp_path(tag: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("factbridge-prog-{}-{}.txt", tag, nanos))
    }

    #[test]
    fn deltas_reach_handler_with_table_names() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut p = program(seen.clone());
        let t = p.tables().require("t.Kv").unwrap();
        let out = p.commit_batch(vec![Command::insert_or_update(t, kv("a", 1))]).unwrap();
        assert_eq!(out, BatchOutcome { commands: 1, deltas: 1 });
        assert_eq!(seen.lock().unwrap().as_slice(), &[("t.Kv".to_string(), Polarity::Insert, kv("a", 1))]);
    }

    #[test]
    fn failed_apply_rolls_back() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut p = program(seen.clone());
        let t = p.tables().require("t.Kv").unwrap();
        let err = p
            .commit_batch(vec![Command::insert(t, kv("a", 1)), Command::insert(t, kv("a", 2))])
            .unwrap_err();
        assert_eq!(err.op(), "apply");
        assert!(err.to_string().contains("t.Kv x2"));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(p.engine().row_count(t), 0);
        // engine is usable again
        assert!(p.commit_batch(vec![Command::insert(t, kv("a", 1))]).is_ok());
    }

    #[test]
    fn restarting_a_recording_closes_the_previous_one() {
        let mut p = program(Arc::new(Mutex::new(Vec::new())));
        let t = p.tables().require("t.Kv").unwrap();
        let first = tmp_path("first");
        let second = tmp_path("second");

        p.start_recording(&first).unwrap();
        p.commit_batch(vec![Command::insert_or_update(t, kv("a", 1))]).unwrap();
        p.start_recording(&second).unwrap();
        p.commit_batch(vec![Command::delete_key(t, Value::string("a"))]).unwrap();
        p.stop_recording().unwrap();
        assert!(!p.is_recording());

        let one = std::fs::read_to_string(&first).unwrap();
        let two = std::fs::read_to_string(&second).unwrap();
        assert_eq!(one, "start;\ninsert_or_update t.Kv[(\"a\", 1)];\ncommit dump_changes;\n");
        assert_eq!(two, "start;\ndelete_key t.Kv \"a\";\ncommit dump_changes;\n");
        let _ = std::fs::remove_file(&first);
        let _ = std::fs::remove_file(&second);
    }

    #[test]
    fn rolled_back_batches_are_marked_in_the_recording() {
        let mut p = program(Arc::new(Mutex::new(Vec::new())));
        let t = p.tables().require("t.Kv").unwrap();
        let path = tmp_path("rollback");
        p.start_recording(&path).unwrap();
        let _ = p.commit_batch(vec![Command::insert(t, kv("a", 1)), Command::insert(t, kv("a", 2))]);
        p.stop_recording().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("rollback;\n"));
        let _ = std::fs::remove_file(&path);
    }

    /// Refuses the first `start_transaction`, then defers to the wrapped engine.
    struct FlakyStart {
        inner: MemEngine,
        refuse: bool,
    }

    impl Engine for FlakyStart {
        fn table_id(&self, name: &str) -> Result<TableId, EngineError> { self.inner.table_id(name) }
        fn table_name(&self, id: TableId) -> Result<String, EngineError> { self.inner.table_name(id) }
        fn start_transaction(&mut self) -> Result<(), EngineError> {
            if std::mem::take(&mut self.refuse) {
                return Err(EngineError::Status { op: "start", code: -1 });
            }
            self.inner.start_transaction()
        }
        fn apply_commands(&mut self, cmds: Vec<Command>) -> Result<(), EngineError> { self.inner.apply_commands(cmds) }
        fn commit_transaction(&mut self, on_delta: &mut dyn FnMut(OutputDelta)) -> Result<(), EngineError> {
            self.inner.commit_transaction(on_delta)
        }
        fn rollback_transaction(&mut self) -> Result<(), EngineError> { self.inner.rollback_transaction() }
    }

    #[test]
    fn refused_start_leaves_no_trace_in_the_recording() {
        let eng = FlakyStart { inner: MemEngine::new().with_table("t.A"), refuse: true };
        let reg = TableRegistry::resolve(&eng, &["t.A"]).unwrap();
        let mut p = Program::new(eng, reg, Box::new(|_: &str, _: OutputDelta| {}));
        let t = p.tables().require("t.A").unwrap();
        let path = tmp_path("refused");
        p.start_recording(&path).unwrap();

        let err = p.commit_batch(vec![Command::insert(t, Value::u32(1))]).unwrap_err();
        assert_eq!(err.op(), "start");
        p.commit_batch(vec![Command::insert(t, Value::u32(2))]).unwrap();
        p.stop_recording().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "start;\ninsert t.A[2];\ncommit dump_changes;\n");
        let _ = std::fs::remove_file(&path);
    }
}
