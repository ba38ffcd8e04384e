//! factbridge core types: values, commands, output deltas.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod value;

pub use value::{Ctor, Either, Int, Struct, Tag, Value, ValueError};

/// Stable engine handle for a named table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u64);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Insert,
    InsertOrUpdate,
    /// Delete the row equal to the payload.
    DeleteByValue,
    /// Delete the row whose key equals the payload.
    DeleteByKey,
}

impl CommandKind {
    /// Keyword used in command recordings.
    pub fn verb(self) -> &'static str {
        match self {
            CommandKind::Insert => "insert",
            CommandKind::InsertOrUpdate => "insert_or_update",
            CommandKind::DeleteByValue => "delete_val",
            CommandKind::DeleteByKey => "delete_key",
        }
    }
}

/// A single table update. Owns its payload; sending it moves the value into the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub table: TableId,
    pub value: Value,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(table: TableId, value: Value, kind: CommandKind) -> Self { Self { table, value, kind } }
    pub fn insert(table: TableId, value: Value) -> Self { Self::new(table, value, CommandKind::Insert) }
    pub fn insert_or_update(table: TableId, value: Value) -> Self { Self::new(table, value, CommandKind::InsertOrUpdate) }
    pub fn delete_val(table: TableId, value: Value) -> Self { Self::new(table, value, CommandKind::DeleteByValue) }
    pub fn delete_key(table: TableId, key: Value) -> Self { Self::new(table, key, CommandKind::DeleteByKey) }
}

/// Whether a delta is an insertion (+1) or a retraction (-1). There is no update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    Insert,
    Delete,
}

impl Polarity {
    pub fn weight(self) -> i8 {
        match self {
            Polarity::Insert => 1,
            Polarity::Delete => -1,
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Polarity::Insert => f.write_str("+1"),
            Polarity::Delete => f.write_str("-1"),
        }
    }
}

/// A row that became true or false in an output table at commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDelta {
    pub table: TableId,
    pub value: Value,
    pub polarity: Polarity,
}

pub mod prelude {
    pub use super::{Command, CommandKind, Ctor, Either, OutputDelta, Polarity, TableId, Value, ValueError};
}
