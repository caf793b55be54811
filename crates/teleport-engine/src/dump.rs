//! Database dumper: tables into size-bounded SQL chunks.
//!
//! The dumper is a cursor machine. Each [`Dumper::step`] performs one unit
//! of work (a definition or a row window) and mutates a [`DumpCursor`] the
//! caller persists. The open chunk's committed length lives in the cursor;
//! [`Dumper::reconcile`] truncates the file back to it on re-entry so a
//! batch that crashed after appending never duplicates statements.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use teleport_core::Database;
use teleport_core::digest::digest_file;
use teleport_package::ChunkDescriptor;

use crate::error::{EngineError, EngineResult};
use crate::sql::{render_definition, render_dependents, render_insert};

/// Tables owned by the engine itself; never dumped or snapshotted.
pub const INTERNAL_TABLE_PREFIX: &str = "_tp_";

#[must_use]
pub fn is_internal_table(name: &str) -> bool {
    name.starts_with(INTERNAL_TABLE_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChunk {
    pub sequence: u64,
    /// Bytes committed to the chunk file.
    pub len: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpCursor {
    pub table_index: usize,
    pub row_offset: u64,
    pub definition_written: bool,
    pub open_chunk: Option<OpenChunk>,
    pub next_sequence: u64,
    pub rows_dumped: u64,
    pub statements: u64,
}

/// What a step accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpStep {
    /// Work remains; any chunks closed during the step are returned.
    Progress(Vec<ChunkDescriptor>),
    /// All tables dumped and the final chunk (if any) closed.
    Finished(Vec<ChunkDescriptor>),
}

pub struct Dumper<'a> {
    pub db: &'a dyn Database,
    pub work_dir: &'a Path,
    pub chunk_size: u64,
    pub rows_per_window: usize,
}

impl Dumper<'_> {
    fn chunk_path(&self, sequence: u64) -> PathBuf {
        self.work_dir
            .join(ChunkDescriptor::database(sequence, 0, String::new()).entry_name())
    }

    /// Truncate the open chunk to its committed length.
    pub fn reconcile(&self, cursor: &DumpCursor) -> EngineResult<()> {
        let Some(open) = cursor.open_chunk else {
            return Ok(());
        };
        let path = self.chunk_path(open.sequence);
        let actual = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if actual < open.len {
            return Err(EngineError::InvalidState(format!(
                "chunk {} holds {actual} bytes, {} committed",
                path.display(),
                open.len
            )));
        }
        if actual > open.len {
            tracing::debug!(
                chunk = open.sequence,
                committed = open.len,
                found = actual,
                "[dump] truncating uncommitted tail"
            );
            OpenOptions::new().write(true).open(&path)?.set_len(open.len)?;
        }
        Ok(())
    }

    /// Perform one unit of work over `tables`.
    pub fn step(&self, tables: &[String], cursor: &mut DumpCursor) -> EngineResult<DumpStep> {
        let mut closed = Vec::new();
        let Some(table) = tables.get(cursor.table_index) else {
            if let Some(chunk) = self.close_chunk(cursor)? {
                closed.push(chunk);
            }
            return Ok(DumpStep::Finished(closed));
        };

        if !cursor.definition_written {
            let definition = render_definition(self.db, table)?;
            self.append(cursor, &[definition], &mut closed)?;
            cursor.definition_written = true;
            cursor.statements += 2;
            return Ok(DumpStep::Progress(closed));
        }

        let rows = self
            .db
            .fetch_rows(table, cursor.row_offset, self.rows_per_window)?;
        if rows.is_empty() {
            // Indexes and triggers go after the rows so replayed inserts
            // neither fire triggers nor pay for index upkeep.
            let dependents = render_dependents(self.db, table)?;
            if !dependents.is_empty() {
                self.append(cursor, &dependents, &mut closed)?;
                cursor.statements += dependents.len() as u64;
            }
            // Also covers a stale offset past the end of a shrunk table.
            tracing::debug!(table = %table, offset = cursor.row_offset, "[dump] table done");
            cursor.table_index += 1;
            cursor.row_offset = 0;
            cursor.definition_written = false;
            return Ok(DumpStep::Progress(closed));
        }
        let statements: Vec<String> = rows
            .iter()
            .map(|row| render_insert(self.db, table, row))
            .collect();
        self.append(cursor, &statements, &mut closed)?;
        let count = rows.len() as u64;
        cursor.row_offset += count;
        cursor.rows_dumped += count;
        cursor.statements += count;
        Ok(DumpStep::Progress(closed))
    }

    /// Append statements, rolling over to a new chunk whenever the next
    /// statement would push a non-empty chunk past `chunk_size`.
    fn append(
        &self,
        cursor: &mut DumpCursor,
        statements: &[String],
        closed: &mut Vec<ChunkDescriptor>,
    ) -> EngineResult<()> {
        let mut file: Option<File> = None;
        for statement in statements {
            let bytes = statement.as_bytes();
            let size = bytes.len() as u64;
            if let Some(open) = cursor.open_chunk {
                if open.len > 0 && open.len + size > self.chunk_size {
                    if let Some(f) = file.take() {
                        f.sync_data()?;
                    }
                    if let Some(chunk) = self.close_chunk(cursor)? {
                        closed.push(chunk);
                    }
                }
            }
            let open = match cursor.open_chunk {
                Some(open) => open,
                None => {
                    let open = OpenChunk {
                        sequence: cursor.next_sequence,
                        len: 0,
                    };
                    cursor.next_sequence += 1;
                    let path = self.chunk_path(open.sequence);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    File::create(&path)?;
                    cursor.open_chunk = Some(open);
                    open
                }
            };
            if file.is_none() {
                file = Some(
                    OpenOptions::new()
                        .append(true)
                        .open(self.chunk_path(open.sequence))?,
                );
            }
            if let Some(f) = file.as_mut() {
                f.write_all(bytes)?;
            }
            cursor.open_chunk = Some(OpenChunk {
                sequence: open.sequence,
                len: open.len + size,
            });
        }
        if let Some(f) = file {
            f.sync_data()?;
        }
        Ok(())
    }

    fn close_chunk(&self, cursor: &mut DumpCursor) -> EngineResult<Option<ChunkDescriptor>> {
        let Some(open) = cursor.open_chunk.take() else {
            return Ok(None);
        };
        let digest = digest_file(&self.chunk_path(open.sequence))?;
        tracing::debug!(chunk = open.sequence, bytes = open.len, "[dump] chunk closed");
        Ok(Some(ChunkDescriptor::database(open.sequence, open.len, digest)))
    }
}

/// Tables eligible for export, in the order the host lists them.
pub fn exportable_tables(db: &dyn Database) -> teleport_core::Result<Vec<String>> {
    Ok(db
        .list_tables()?
        .into_iter()
        .filter(|t| !is_internal_table(t))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use teleport_core::{Row, SqlValue};

    /// In-memory table set; each table has one integer column `n` and an
    /// index on it.
    struct FakeDb {
        tables: Vec<(String, u64)>,
        fetches: RefCell<u32>,
    }

    impl Database for FakeDb {
        fn list_tables(&self) -> teleport_core::Result<Vec<String>> {
            Ok(self.tables.iter().map(|(n, _)| n.clone()).collect())
        }
        fn table_exists(&self, table: &str) -> teleport_core::Result<bool> {
            Ok(self.tables.iter().any(|(n, _)| n == table))
        }
        fn table_definition(&self, table: &str) -> teleport_core::Result<String> {
            Ok(format!("CREATE TABLE \"{table}\" (\n  n INTEGER\n)"))
        }
        fn table_dependents(&self, table: &str) -> teleport_core::Result<Vec<String>> {
            Ok(vec![format!("CREATE INDEX \"{table}_n\"\n  ON \"{table}\" (n)")])
        }
        fn count_rows(&self, table: &str) -> teleport_core::Result<u64> {
            Ok(self
                .tables
                .iter()
                .find(|(n, _)| n == table)
                .map_or(0, |(_, c)| *c))
        }
        fn fetch_rows(&self, table: &str, offset: u64, limit: usize) -> teleport_core::Result<Vec<Row>> {
            *self.fetches.borrow_mut() += 1;
            let total = self.count_rows(table)?;
            Ok((offset..total.min(offset + limit as u64))
                .map(|i| Row::new(vec!["n".into()], vec![SqlValue::Integer(i as i64)]))
                .collect())
        }
        fn execute(&self, _sql: &str) -> teleport_core::Result<()> {
            Ok(())
        }
    }

    fn drain(dumper: &Dumper<'_>, tables: &[String], cursor: &mut DumpCursor) -> Vec<ChunkDescriptor> {
        let mut chunks = Vec::new();
        loop {
            match dumper.step(tables, cursor).unwrap() {
                DumpStep::Progress(c) => chunks.extend(c),
                DumpStep::Finished(c) => {
                    chunks.extend(c);
                    return chunks;
                }
            }
        }
    }

    #[test]
    fn small_tables_share_one_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let db = FakeDb {
            tables: vec![("a".into(), 5), ("empty".into(), 0)],
            fetches: RefCell::new(0),
        };
        let dumper = Dumper {
            db: &db,
            work_dir: dir.path(),
            chunk_size: 1024 * 1024,
            rows_per_window: 2,
        };
        let tables = db.list_tables().unwrap();
        let mut cursor = DumpCursor::default();
        let chunks = drain(&dumper, &tables, &mut cursor);
        assert_eq!(chunks.len(), 1);
        let text = fs::read_to_string(dir.path().join(chunks[0].entry_name())).unwrap();
        assert_eq!(text.matches("INSERT INTO").count(), 5);
        assert_eq!(text.matches("CREATE TABLE").count(), 2);
        assert_eq!(chunks[0].size, text.len() as u64);
        assert_eq!(cursor.rows_dumped, 5);
        assert!(cursor.open_chunk.is_none());
    }

    #[test]
    fn dependents_follow_the_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db = FakeDb {
            tables: vec![("a".into(), 3)],
            fetches: RefCell::new(0),
        };
        let dumper = Dumper {
            db: &db,
            work_dir: dir.path(),
            chunk_size: 1024 * 1024,
            rows_per_window: 10,
        };
        let mut cursor = DumpCursor::default();
        let chunks = drain(&dumper, &["a".to_string()], &mut cursor);
        let text = fs::read_to_string(dir.path().join(chunks[0].entry_name())).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2 + 3 + 1);
        assert_eq!(lines[5], "CREATE INDEX \"a_n\" ON \"a\" (n);");
        assert!(lines[4].starts_with("INSERT INTO"));
        assert_eq!(cursor.statements, 6);
    }

    #[test]
    fn chunks_roll_over_at_size_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let db = FakeDb {
            tables: vec![("t".into(), 200)],
            fetches: RefCell::new(0),
        };
        let dumper = Dumper {
            db: &db,
            work_dir: dir.path(),
            chunk_size: 1024,
            rows_per_window: 50,
        };
        let mut cursor = DumpCursor::default();
        let chunks = drain(&dumper, &["t".to_string()], &mut cursor);
        assert!(chunks.len() > 1);
        let mut inserts = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i as u64);
            assert!(chunk.size <= 1024);
            let text = fs::read_to_string(dir.path().join(chunk.entry_name())).unwrap();
            assert!(text.ends_with(";\n"));
            inserts += text.matches("INSERT INTO").count();
        }
        assert_eq!(inserts, 200);
    }

    #[test]
    fn reconcile_drops_uncommitted_tail() {
        let dir = tempfile::tempdir().unwrap();
        let db = FakeDb {
            tables: vec![("t".into(), 4)],
            fetches: RefCell::new(0),
        };
        let dumper = Dumper {
            db: &db,
            work_dir: dir.path(),
            chunk_size: 1 << 20,
            rows_per_window: 2,
        };
        let tables = vec!["t".to_string()];
        let mut cursor = DumpCursor::default();
        dumper.step(&tables, &mut cursor).unwrap();
        dumper.step(&tables, &mut cursor).unwrap();
        let committed = cursor.clone();

        // A batch appends the next window, then "crashes" before persisting.
        let mut lost = committed.clone();
        dumper.step(&tables, &mut lost).unwrap();

        let mut cursor = committed;
        dumper.reconcile(&cursor).unwrap();
        let chunks = drain(&dumper, &tables, &mut cursor);
        let text = fs::read_to_string(dir.path().join(chunks[0].entry_name())).unwrap();
        assert_eq!(text.matches("INSERT INTO").count(), 4);
    }

    #[test]
    fn stale_offset_on_empty_table_advances() {
        let dir = tempfile::tempdir().unwrap();
        let db = FakeDb {
            tables: vec![("gone".into(), 0), ("next".into(), 1)],
            fetches: RefCell::new(0),
        };
        let dumper = Dumper {
            db: &db,
            work_dir: dir.path(),
            chunk_size: 1 << 20,
            rows_per_window: 10,
        };
        let tables = db.list_tables().unwrap();
        let mut cursor = DumpCursor {
            definition_written: true,
            row_offset: 500,
            ..DumpCursor::default()
        };
        dumper.step(&tables, &mut cursor).unwrap();
        assert_eq!(cursor.table_index, 1);
        assert_eq!(cursor.row_offset, 0);
        assert!(!cursor.definition_written);
        assert_eq!(*db.fetches.borrow(), 1);
    }

    #[test]
    fn internal_tables_are_not_exportable() {
        let db = FakeDb {
            tables: vec![("_tp_shadow_x".into(), 1), ("posts".into(), 1)],
            fetches: RefCell::new(0),
        };
        assert_eq!(exportable_tables(&db).unwrap(), vec!["posts".to_string()]);
    }
}
