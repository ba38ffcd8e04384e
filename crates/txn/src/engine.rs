//! Engine seam and the resolved table registry.

use factbridge_core::{Command, OutputDelta, TableId};
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("{op} returned error code {code}")]
    Status { op: &'static str, code: i32 },
    #[error("unknown table {0:?}")]
    UnknownTable(String),
    #[error("unknown table id {0}")]
    UnknownTableId(TableId),
    #[error("table {name:?} resolved to {id} but {id} names {back:?}")]
    TableMismatch { name: String, id: TableId, back: String },
    #[error("no transaction in progress")]
    NoTransaction,
    #[error("a transaction is already in progress")]
    TransactionInProgress,
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// A transactional incremental computation engine.
///
/// Exactly one owner drives an engine at a time; calls are never concurrent.
/// `commit_transaction` reports each output delta through `on_delta` before it
/// returns, in the order the engine produces them.
pub trait Engine: Send {
    fn table_id(&self, name: &str) -> Result<TableId, EngineError>;
    fn table_name(&self, id: TableId) -> Result<String, EngineError>;

    fn start_transaction(&mut self) -> Result<(), EngineError>;
    fn apply_commands(&mut self, cmds: Vec<Command>) -> Result<(), EngineError>;
    fn commit_transaction(&mut self, on_delta: &mut dyn FnMut(OutputDelta)) -> Result<(), EngineError>;
    fn rollback_transaction(&mut self) -> Result<(), EngineError>;
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn table_id(&self, name: &str) -> Result<TableId, EngineError> { (**self).table_id(name) }
    fn table_name(&self, id: TableId) -> Result<String, EngineError> { (**self).table_name(id) }
    fn start_transaction(&mut self) -> Result<(), EngineError> { (**self).start_transaction() }
    fn apply_commands(&mut self, cmds: Vec<Command>) -> Result<(), EngineError> { (**self).apply_commands(cmds) }
    fn commit_transaction(&mut self, on_delta: &mut dyn FnMut(OutputDelta)) -> Result<(), EngineError> {
        (**self).commit_transaction(on_delta)
    }
    fn rollback_transaction(&mut self) -> Result<(), EngineError> { (**self).rollback_transaction() }
}

/// Table names and ids looked up once at startup.
///
/// Resolution checks both directions so a registry never holds a pair the
/// engine would disagree with.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    by_name: FxHashMap<String, TableId>,
    by_id: FxHashMap<TableId, String>,
}

impl TableRegistry {
    pub fn resolve<E: Engine + ?Sized>(engine: &E, names: &[&str]) -> Result<Self, EngineError> {
        let mut reg = TableRegistry::default();
        for &name in names {
            let id = engine.table_id(name)?;
            let back = engine.table_name(id)?;
            if back != name {
                return Err(EngineError::TableMismatch { name: name.to_string(), id, back });
            }
            reg.by_name.insert(name.to_string(), id);
            reg.by_id.insert(id, back);
        }
        Ok(reg)
    }

    pub fn id(&self, name: &str) -> Option<TableId> { self.by_name.get(name).copied() }

    pub fn require(&self, name: &str) -> Result<TableId, EngineError> {
        self.id(name).ok_or_else(|| EngineError::UnknownTable(name.to_string()))
    }

    pub fn name(&self, id: TableId) -> Option<&str> { self.by_id.get(&id).map(String::as_str) }

    pub fn len(&self) -> usize { self.by_id.len() }
    pub fn is_empty(&self) -> bool { self.by_id.is_empty() }

    /// Registered tables ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = (TableId, &str)> {
        let mut all: Vec<_> = self.by_id.iter().map(|(id, n)| (*id, n.as_str())).collect();
        all.sort_by_key(|(id, _)| *id);
        all.into_iter()
    }
}
