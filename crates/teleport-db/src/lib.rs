//! SQLite implementation of [`teleport_core::Database`].
//!
//! Rows are windowed by `rowid` (or by the first column for `WITHOUT ROWID`
//! tables) so repeated `fetch_rows` calls at increasing offsets visit every
//! row exactly once while the table is not being written.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::{NoExpand, Regex};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, params};
use teleport_core::{Database, Error, Result, Row, SqlValue};

static CREATE_TABLE_HEAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)^\s*CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:"(?:[^"]|"")+"|`[^`]+`|\[[^\]]+\]|[^\s(]+)"#,
    )
    .expect("create table regex")
});

fn db_err(context: &str, err: &rusqlite::Error) -> Error {
    Error::Database(format!("{context}: {err}"))
}

/// A host database backed by one SQLite connection.
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| db_err("open", &e))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| db_err("busy_timeout", &e))?;
        tracing::debug!(path = %path.display(), "opened sqlite database");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("open", &e))?;
        Ok(Self { conn })
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    fn order_clause(&self, table: &str) -> Result<&'static str> {
        let definition = self.table_definition(table)?;
        if definition.to_ascii_uppercase().contains("WITHOUT ROWID") {
            Ok("ORDER BY 1")
        } else {
            Ok("ORDER BY rowid")
        }
    }
}

impl Database for SqliteDatabase {
    fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .map_err(|e| db_err("list_tables", &e))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| db_err("list_tables", &e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("list_tables", &e))?;
        Ok(names)
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("table_exists", &e))?;
        Ok(found.is_some())
    }

    fn table_definition(&self, table: &str) -> Result<String> {
        let sql: Option<String> = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("table_definition", &e))?;
        sql.ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    fn table_dependents(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT sql FROM sqlite_master \
                 WHERE tbl_name = ?1 AND type IN ('index', 'trigger') AND sql IS NOT NULL \
                 ORDER BY type = 'trigger', rowid",
            )
            .map_err(|e| db_err("table_dependents", &e))?;
        let statements = stmt
            .query_map(params![table], |row| row.get::<_, String>(0))
            .map_err(|e| db_err("table_dependents", &e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("table_dependents", &e))?;
        Ok(statements)
    }

    fn count_rows(&self, table: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", self.quote_identifier(table)),
                [],
                |row| row.get(0),
            )
            .map_err(|e| db_err("count_rows", &e))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn fetch_rows(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<Row>> {
        let order = self.order_clause(table)?;
        let sql = format!(
            "SELECT * FROM {} {order} LIMIT ?1 OFFSET ?2",
            self.quote_identifier(table)
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| db_err("fetch_rows", &e))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| (*c).to_string()).collect();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);

        let mut rows = stmt
            .query(params![limit, offset])
            .map_err(|e| db_err("fetch_rows", &e))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| db_err("fetch_rows", &e))? {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                let value = row.get_ref(idx).map_err(|e| db_err("fetch_rows", &e))?;
                values.push(match value {
                    ValueRef::Null => SqlValue::Null,
                    ValueRef::Integer(i) => SqlValue::Integer(i),
                    ValueRef::Real(f) => SqlValue::Real(f),
                    ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
                });
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    fn execute(&self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| db_err("execute", &e))
    }

    /// Keeps column types and constraints by cloning the stored definition
    /// under the shadow name before copying rows.
    fn snapshot_table(&self, table: &str, shadow: &str) -> Result<()> {
        let definition = self.table_definition(table)?;
        let quoted_shadow = self.quote_identifier(shadow);
        if !CREATE_TABLE_HEAD_RE.is_match(&definition) {
            return Err(Error::Database(format!(
                "unrecognised definition for {table}"
            )));
        }
        let create = CREATE_TABLE_HEAD_RE
            .replace(&definition, NoExpand(&format!("CREATE TABLE {quoted_shadow}")))
            .into_owned();
        self.execute(&format!(
            "{create}; INSERT INTO {quoted_shadow} SELECT * FROM {}",
            self.quote_identifier(table)
        ))
    }
}
