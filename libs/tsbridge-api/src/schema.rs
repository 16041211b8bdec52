use std::fmt;

use serde::Serialize;

use crate::error::ValidationError;
use crate::store::Statement;
use crate::value::BindValue;

/// Outcome of a schema's acceptance filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Accept,
    /// Well-formed but not wanted. Carries the reason for the log line.
    Reject(String),
}

/// Per-topic record shape: decoding, filtering and SQL.
///
/// Pure data and logic, no I/O. One implementation per kind of reading;
/// the engine runs the same receiver/writer pair for all of them.
pub trait RecordSchema: Send + Sync + 'static {
    /// Validated, immutable record produced by [`decode`](Self::decode).
    type Record: fmt::Debug + Serialize + Send + 'static;

    /// Short schema name used in configuration and logs (e.g. `"weather"`).
    fn name(&self) -> &str;

    /// Parse and validate one inbound payload.
    fn decode(&self, payload: &[u8]) -> Result<Self::Record, ValidationError>;

    /// Acceptance filter applied after a successful decode.
    fn accept(&self, _record: &Self::Record) -> Acceptance {
        Acceptance::Accept
    }

    /// Table setup, in execution order. Must be safe to run on every start.
    fn ddl(&self) -> Vec<Statement>;

    /// Parameterized insert statement (`$1..$n` placeholders).
    fn insert_sql(&self) -> &'static str;

    /// Bind values for [`insert_sql`](Self::insert_sql), in placeholder order.
    fn insert_params(&self, record: &Self::Record) -> Vec<BindValue>;

    /// Ready-to-execute insert for one record.
    fn insert(&self, record: &Self::Record) -> Statement {
        Statement::with_params(self.insert_sql(), self.insert_params(record))
    }
}
