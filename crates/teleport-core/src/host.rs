//! Capabilities the embedding host provides to the engines.
//!
//! The engines never talk to a concrete database client or job registry.
//! They consume these traits, which keeps every phase testable against an
//! in-process SQLite database and a scratch directory.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single column value as returned by [`Database::fetch_rows`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// One row of a table window, columns in definition order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<SqlValue>,
}

impl Row {
    #[must_use]
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }
}

/// Relational database of the running application.
pub trait Database {
    /// User tables, sorted by name.
    fn list_tables(&self) -> Result<Vec<String>>;

    fn table_exists(&self, table: &str) -> Result<bool>;

    /// `CREATE TABLE` statement that recreates `table` (no trailing `;`).
    fn table_definition(&self, table: &str) -> Result<String>;

    /// `CREATE INDEX` and `CREATE TRIGGER` statements attached to `table`,
    /// indexes first, each without a trailing `;`. Implicit indexes backing
    /// `UNIQUE` and `PRIMARY KEY` constraints are part of the definition and
    /// not listed.
    fn table_dependents(&self, table: &str) -> Result<Vec<String>>;

    fn count_rows(&self, table: &str) -> Result<u64>;

    /// Up to `limit` rows starting at `offset`, ordered by a key that is
    /// stable across calls.
    fn fetch_rows(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<Row>>;

    /// Execute one or more complete SQL statements.
    fn execute(&self, sql: &str) -> Result<()>;

    fn begin(&self) -> Result<()> {
        self.execute("BEGIN")
    }

    fn commit(&self) -> Result<()> {
        self.execute("COMMIT")
    }

    fn rollback_transaction(&self) -> Result<()> {
        self.execute("ROLLBACK")
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Copy `table` (definition and rows) into a new table named `shadow`.
    fn snapshot_table(&self, table: &str, shadow: &str) -> Result<()> {
        self.execute(&format!(
            "CREATE TABLE {} AS SELECT * FROM {}",
            self.quote_identifier(shadow),
            self.quote_identifier(table)
        ))
    }

    /// Replace `table` with `shadow`, consuming the shadow.
    fn restore_table(&self, shadow: &str, table: &str) -> Result<()> {
        self.execute(&format!(
            "DROP TABLE IF EXISTS {}; ALTER TABLE {} RENAME TO {}",
            self.quote_identifier(table),
            self.quote_identifier(shadow),
            self.quote_identifier(table)
        ))
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.execute(&format!(
            "DROP TABLE IF EXISTS {}",
            self.quote_identifier(table)
        ))
    }
}

/// Opaque authorization check performed before every public engine call.
pub trait AccessGate {
    fn is_authorized(&self) -> bool;
}

/// Gate that admits every caller. Suitable for the CLI and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessGate for AllowAll {
    fn is_authorized(&self) -> bool {
        true
    }
}

impl<F> AccessGate for F
where
    F: Fn() -> bool,
{
    fn is_authorized(&self) -> bool {
        self()
    }
}

/// Facts about the running host that a package's environment block is
/// checked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEnvironment {
    pub runtime_version: String,
    pub host_version: String,
    pub table_prefix: String,
    pub collation: String,
}

impl Default for HostEnvironment {
    fn default() -> Self {
        Self {
            runtime_version: "1.0.0".to_string(),
            host_version: "1.0.0".to_string(),
            table_prefix: String::new(),
            collation: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Export,
    Import,
}

impl JobKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Export => "export",
            Self::Import => "import",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable key/value persistence of job records, keyed by kind and id.
pub trait JobStore {
    fn get(&self, kind: JobKind, id: &str) -> Result<Option<serde_json::Value>>;

    fn put(&self, kind: JobKind, id: &str, record: &serde_json::Value) -> Result<()>;

    fn delete(&self, kind: JobKind, id: &str) -> Result<()>;

    /// Ids of every stored record of `kind`.
    fn list(&self, kind: JobKind) -> Result<Vec<String>>;
}

/// Load and deserialize a record, failing with `JobNotFound` when absent.
pub fn load_record<T, S>(store: &S, kind: JobKind, id: &str) -> Result<T>
where
    T: DeserializeOwned,
    S: JobStore + ?Sized,
{
    let value = store
        .get(kind, id)?
        .ok_or_else(|| Error::JobNotFound(format!("{kind}/{id}")))?;
    Ok(serde_json::from_value(value)?)
}

pub fn save_record<T, S>(store: &S, kind: JobKind, id: &str, record: &T) -> Result<()>
where
    T: Serialize,
    S: JobStore + ?Sized,
{
    let value = serde_json::to_value(record)?;
    store.put(kind, id, &value)
}
