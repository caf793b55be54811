//! Drivers shared by the engine integration tests.

#![allow(dead_code)]

use std::cell::Cell;
use std::path::{Path, PathBuf};

use teleport_core::{AllowAll, Config, Database, Result, Row};
use teleport_engine::{ExportEngine, FileJobStore, ImportEngine, JobStatus, JobStatusView};

const MAX_CALLS: usize = 100_000;

pub fn store_for(config: &Config) -> FileJobStore {
    FileJobStore::new(config.jobs_dir())
}

/// Advance until the job stops running.
pub fn drive_export(engine: &ExportEngine<'_>, id: &str) -> JobStatusView {
    for _ in 0..MAX_CALLS {
        let view = engine.advance(id).expect("advance export");
        if !view.needs_advance() {
            return view;
        }
    }
    panic!("export {id} did not finish");
}

pub fn drive_import(engine: &ImportEngine<'_>, id: &str) -> JobStatusView {
    for _ in 0..MAX_CALLS {
        let view = engine.advance(id).expect("advance import");
        if !view.needs_advance() {
            return view;
        }
    }
    panic!("import {id} did not finish");
}

/// Run a whole export of `source` from `db` and return the package path.
pub fn export_package(config: &Config, db: &dyn Database, source: &Path) -> PathBuf {
    let store = store_for(config);
    let engine = ExportEngine::new(config, db, &store, &AllowAll);
    let id = engine.start(source, &[]).expect("start export").id;
    let view = drive_export(&engine, &id);
    assert_eq!(view.status, JobStatus::Completed, "export failed: {view:?}");
    engine.package_path(&id)
}

/// Pass-through [`Database`] that counts every mutating call.
pub struct CountingDb<'a> {
    inner: &'a dyn Database,
    writes: Cell<usize>,
}

impl<'a> CountingDb<'a> {
    pub fn new(inner: &'a dyn Database) -> Self {
        Self {
            inner,
            writes: Cell::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.get()
    }

    fn count(&self) {
        self.writes.set(self.writes.get() + 1);
    }
}

impl Database for CountingDb<'_> {
    fn list_tables(&self) -> Result<Vec<String>> {
        self.inner.list_tables()
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        self.inner.table_exists(table)
    }

    fn table_definition(&self, table: &str) -> Result<String> {
        self.inner.table_definition(table)
    }

    fn table_dependents(&self, table: &str) -> Result<Vec<String>> {
        self.inner.table_dependents(table)
    }

    fn count_rows(&self, table: &str) -> Result<u64> {
        self.inner.count_rows(table)
    }

    fn fetch_rows(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<Row>> {
        self.inner.fetch_rows(table, offset, limit)
    }

    fn execute(&self, sql: &str) -> Result<()> {
        self.count();
        self.inner.execute(sql)
    }

    fn begin(&self) -> Result<()> {
        self.count();
        self.inner.begin()
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback_transaction(&self) -> Result<()> {
        self.inner.rollback_transaction()
    }

    fn snapshot_table(&self, table: &str, shadow: &str) -> Result<()> {
        self.count();
        self.inner.snapshot_table(table, shadow)
    }

    fn restore_table(&self, shadow: &str, table: &str) -> Result<()> {
        self.count();
        self.inner.restore_table(shadow, table)
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.count();
        self.inner.drop_table(table)
    }
}
