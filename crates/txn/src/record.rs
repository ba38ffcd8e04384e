//! Replayable text log of every transaction sent to the engine.
//!
//! ```text
//! start;
//! insert_or_update k8spolicy.Pod[Pod{...}],
//! delete_key k8spolicy.Namespace "ns1";
//! commit dump_changes;
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use factbridge_core::{Command, CommandKind};

use crate::engine::TableRegistry;

pub struct CommandRecorder {
    out: BufWriter<File>,
    path: PathBuf,
}

impl CommandRecorder {
    /// Create or truncate `path`.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self { out: BufWriter::new(file), path })
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn record_start(&mut self) -> io::Result<()> { writeln!(self.out, "start;") }

    pub fn record_commands(&mut self, tables: &TableRegistry, cmds: &[Command]) -> io::Result<()> {
        let last = cmds.len().saturating_sub(1);
        for (i, cmd) in cmds.iter().enumerate() {
            let table = match tables.name(cmd.table) {
                Some(name) => name.to_string(),
                None => cmd.table.to_string(),
            };
            let sep = if i == last { ';' } else { ',' };
            match cmd.kind {
                CommandKind::DeleteByKey => writeln!(self.out, "{} {} {}{}", cmd.kind.verb(), table, cmd.value, sep)?,
                _ => writeln!(self.out, "{} {}[{}]{}", cmd.kind.verb(), table, cmd.value, sep)?,
            }
        }
        Ok(())
    }

    pub fn record_commit(&mut self) -> io::Result<()> {
        writeln!(self.out, "commit dump_changes;")?;
        self.out.flush()
    }

    pub fn record_rollback(&mut self) -> io::Result<()> {
        writeln!(self.out, "rollback;")?;
        self.out.flush()
    }

    pub fn close(mut self) -> io::Result<()> { self.out.flush() }
}
