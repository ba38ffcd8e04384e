//! In-memory engine whose outputs are the net changes to its own tables.
//!
//! Useful for dry runs and tests: every committed transaction reports, per
//! touched row and in first-touch order, `-1` for the row that went away and
//! `+1` for the row that replaced it. Rows that end a transaction unchanged
//! produce nothing.

use factbridge_core::{Command, CommandKind, OutputDelta, Polarity, TableId, Value};
use rustc_hash::FxHashMap;

use crate::engine::{Engine, EngineError};

type KeyFn = Box<dyn Fn(&Value) -> Option<Value> + Send>;

struct Table {
    name: String,
    key: Option<KeyFn>,
    rows: FxHashMap<Value, Value>,
}

impl Table {
    fn key_of(&self, v: &Value) -> Result<Value, EngineError> {
        match &self.key {
            Some(f) => f(v).ok_or_else(|| EngineError::Rejected(format!("{}: cannot extract key from {}", self.name, v))),
            None => Ok(v.clone()),
        }
    }

    fn require_key(&self, verb: &str) -> Result<(), EngineError> {
        if self.key.is_none() {
            return Err(EngineError::Rejected(format!("{} on {} which has no key", verb, self.name)));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Pending {
    before: FxHashMap<(TableId, Value), Option<Value>>,
    order: Vec<(TableId, Value)>,
}

#[derive(Default)]
pub struct MemEngine {
    tables: Vec<Table>,
    by_name: FxHashMap<String, TableId>,
    txn: Option<Pending>,
}

impl MemEngine {
    pub fn new() -> Self { Self::default() }

    /// A set-like table: rows are their own key.
    pub fn with_table(self, name: &str) -> Self { self.add(name, None) }

    /// A keyed table; `key` returns `None` for rows it cannot index.
    pub fn with_keyed_table<F>(self, name: &str, key: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + 'static,
    {
        self.add(name, Some(Box::new(key)))
    }

    fn add(mut self, name: &str, key: Option<KeyFn>) -> Self {
        let id = TableId(self.tables.len() as u64);
        self.tables.push(Table { name: name.to_string(), key, rows: FxHashMap::default() });
        self.by_name.insert(name.to_string(), id);
        self
    }

    /// Committed rows of `id`, in no particular order.
    pub fn rows(&self, id: TableId) -> impl Iterator<Item = &Value> {
        self.tables.get(id.0 as usize).into_iter().flat_map(|t| t.rows.values())
    }

    pub fn row_count(&self, id: TableId) -> usize { self.tables.get(id.0 as usize).map_or(0, |t| t.rows.len()) }

    fn apply_one(&mut self, cmd: Command) -> Result<(), EngineError> {
        let pending = self.txn.as_mut().ok_or(EngineError::NoTransaction)?;
        let table = self.tables.get_mut(cmd.table.0 as usize).ok_or(EngineError::UnknownTableId(cmd.table))?;
        let key = match cmd.kind {
            CommandKind::DeleteByKey => {
                table.require_key("delete_key")?;
                cmd.value.clone()
            }
            CommandKind::InsertOrUpdate => {
                table.require_key("insert_or_update")?;
                table.key_of(&cmd.value)?
            }
            _ => table.key_of(&cmd.value)?,
        };
        let slot = (cmd.table, key.clone());
        if !pending.before.contains_key(&slot) {
            pending.before.insert(slot.clone(), table.rows.get(&key).cloned());
            pending.order.push(slot);
        }
        match cmd.kind {
            CommandKind::Insert => match table.rows.get(&key) {
                Some(existing) if *existing != cmd.value => {
                    return Err(EngineError::Rejected(format!("{}: duplicate key {}", table.name, key)));
                }
                _ => {
                    table.rows.insert(key, cmd.value);
                }
            },
            CommandKind::InsertOrUpdate => {
                table.rows.insert(key, cmd.value);
            }
            CommandKind::DeleteByValue => {
                if table.rows.get(&key) == Some(&cmd.value) {
                    table.rows.remove(&key);
                }
            }
            CommandKind::DeleteByKey => {
                table.rows.remove(&key);
            }
        }
        Ok(())
    }
}

impl Engine for MemEngine {
    fn table_id(&self, name: &str) -> Result<TableId, EngineError> {
        self.by_name.get(name).copied().ok_or_else(|| EngineError::UnknownTable(name.to_string()))
    }

    fn table_name(&self, id: TableId) -> Result<String, EngineError> {
        self.tables.get(id.0 as usize).map(|t| t.name.clone()).ok_or(EngineError::UnknownTableId(id))
    }

    fn start_transaction(&mut self) -> Result<(), EngineError> {
        if self.txn.is_some() {
            return Err(EngineError::TransactionInProgress);
        }
        self.txn = Some(Pending::default());
        Ok(())
    }

    fn apply_commands(&mut self, cmds: Vec<Command>) -> Result<(), EngineError> {
        for cmd in cmds {
            self.apply_one(cmd)?;
        }
        Ok(())
    }

    fn commit_transaction(&mut self, on_delta: &mut dyn FnMut(OutputDelta)) -> Result<(), EngineError> {
        let mut pending = self.txn.take().ok_or(EngineError::NoTransaction)?;
        for slot in pending.order {
            let before = pending.before.remove(&slot).flatten();
            let (table, key) = slot;
            let after = self.tables[table.0 as usize].rows.get(&key);
            if before.as_ref() == after {
                continue;
            }
            if let Some(old) = before {
                on_delta(OutputDelta { table, value: old, polarity: Polarity::Delete });
            }
            if let Some(new) = after {
                on_delta(OutputDelta { table, value: new.clone(), polarity: Polarity::Insert });
            }
        }
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<(), EngineError> {
        let pending = self.txn.take().ok_or(EngineError::NoTransaction)?;
        for ((table, key), before) in pending.before {
            let rows = &mut self.tables[table.0 as usize].rows;
            match before {
                Some(row) => rows.insert(key, row),
                None => rows.remove(&key),
            };
        }
        Ok(())
    }
}
