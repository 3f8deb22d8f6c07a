use crate::error::{EngineError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// The operation a command row requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOp {
    /// Credit a user's wallet before the replay exercises it.
    Fund,
    /// Open a session for a product; the `session` column names it.
    Create,
    /// Join the session named in the `session` column.
    Join,
    /// Cancel a still-empty session.
    Cancel,
    /// Run one sweeper pass at the row's timestamp.
    Sweep,
}

/// One row of a command CSV. The `at` column is the wall clock for the row,
/// in epoch milliseconds, and must be non-decreasing down the file.
///
/// The `session` column carries a caller-chosen label, not the shareable
/// code: codes are generated at create time, so labels keep files replayable.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub op: CommandOp,
    pub at: i64,
    pub user: Option<u64>,
    pub product: Option<u32>,
    pub session: Option<String>,
    pub amount: Option<Decimal>,
}

impl Command {
    pub fn user(&self) -> Result<u64> {
        self.user
            .ok_or_else(|| EngineError::Validation(format!("{:?} requires a user", self.op)))
    }

    pub fn product(&self) -> Result<u32> {
        self.product
            .ok_or_else(|| EngineError::Validation(format!("{:?} requires a product", self.op)))
    }

    pub fn session(&self) -> Result<&str> {
        self.session
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::Validation(format!("{:?} requires a session", self.op)))
    }

    pub fn amount(&self) -> Result<Decimal> {
        self.amount
            .ok_or_else(|| EngineError::Validation(format!("{:?} requires an amount", self.op)))
    }
}

/// Reads commands from a CSV source.
///
/// Wraps `csv::Reader` and provides an iterator over `Result<Command>`,
/// trimming whitespace and tolerating short records so rows only need the
/// columns their operation uses.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    /// Creates a new `CommandReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and deserializes commands.
    pub fn commands(self) -> impl Iterator<Item = Result<Command>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(EngineError::from))
    }
}
