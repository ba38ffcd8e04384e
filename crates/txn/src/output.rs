//! Consumers of committed output deltas.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use factbridge_core::OutputDelta;
use serde::Serialize;
use tracing::warn;

/// Receives output deltas synchronously during commit, in engine order.
pub trait OutputHandler: Send {
    fn handle(&mut self, table: &str, delta: OutputDelta);

    /// Called once after every successful commit.
    fn flush(&mut self) {}
}

impl<F> OutputHandler for F
where
    F: FnMut(&str, OutputDelta) + Send,
{
    fn handle(&mut self, table: &str, delta: OutputDelta) { self(table, delta) }
}

/// Drops every delta.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl OutputHandler for DiscardSink {
    fn handle(&mut self, _table: &str, _delta: OutputDelta) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpFormat {
    /// `Table: value +1`
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for DumpFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(DumpFormat::Text),
            "json" => Ok(DumpFormat::Json),
            other => Err(format!("unknown dump format: {}", other)),
        }
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    table: &'a str,
    weight: i8,
    value: &'a factbridge_core::Value,
}

/// Writes one line per delta. Write failures are logged, never propagated
/// into the commit path.
pub struct ChangeDumper {
    out: Box<dyn Write + Send>,
    format: DumpFormat,
    failed: bool,
}

impl ChangeDumper {
    pub fn new<W: Write + Send + 'static>(out: W, format: DumpFormat) -> Self {
        Self { out: Box::new(out), format, failed: false }
    }

    pub fn create(path: impl AsRef<Path>, format: DumpFormat) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self::new(BufWriter::new(file), format))
    }

    pub fn stdout(format: DumpFormat) -> Self { Self::new(io::stdout(), format) }

    fn write_delta(&mut self, table: &str, delta: &OutputDelta) -> io::Result<()> {
        match self.format {
            DumpFormat::Text => writeln!(self.out, "{}: {} {}", table, delta.value, delta.polarity),
            DumpFormat::Json => {
                let line = JsonLine { table, weight: delta.polarity.weight(), value: &delta.value };
                serde_json::to_writer(&mut self.out, &line)?;
                self.out.write_all(b"\n")
            }
        }
    }

    fn report(&mut self, err: io::Error) {
        // once per dumper; a dead sink would otherwise log on every delta
        if !self.failed {
            warn!(error = %err, "change dump write failed");
            self.failed = true;
        }
    }
}

impl OutputHandler for ChangeDumper {
    fn handle(&mut self, table: &str, delta: OutputDelta) {
        if let Err(e) = self.write_delta(table, &delta) {
            self.report(e);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            self.report(e);
        }
    }
}
