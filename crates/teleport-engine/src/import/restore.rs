//! `restore_database`: snapshot the affected tables, then replay the staged
//! SQL chunks in bounded transactions.
//!
//! Each transaction also rewrites this job's row in [`PROGRESS_TABLE`], so
//! the database itself records how far replay got. If the job record is
//! older than the database (crash between commit and record write), the row
//! wins.

use std::path::PathBuf;

use teleport_core::SqlValue;

use super::{ImportEngine, ImportJob, PhaseOutcome, TableBackup, loaded_manifest};
use crate::budget::Budget;
use crate::dump::{exportable_tables, is_internal_table};
use crate::error::EngineResult;
use crate::sql::{StatementReader, render_value};

/// Per-job replay position, written in the same transaction as the data.
pub const PROGRESS_TABLE: &str = "_tp_restore_progress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Position {
    file_index: usize,
    byte_offset: u64,
    line: u64,
}

fn shadow_name(job_id: &str, table: &str) -> String {
    let short: String = job_id.chars().filter(char::is_ascii_hexdigit).take(8).collect();
    format!("_tp_shadow_{short}_{table}")
}

fn integer(value: Option<&SqlValue>) -> Option<u64> {
    match value {
        Some(SqlValue::Integer(n)) => u64::try_from(*n).ok(),
        _ => None,
    }
}

impl ImportEngine<'_> {
    pub(super) fn restore_database(
        &self,
        job: &mut ImportJob,
        budget: &mut Budget,
    ) -> EngineResult<PhaseOutcome> {
        if job.checkpoints.restore.complete {
            return Ok(PhaseOutcome::Complete);
        }
        let manifest = loaded_manifest(job.manifest.as_ref())?;
        let files: Vec<PathBuf> = manifest
            .database_chunks()
            .iter()
            .map(|chunk| job.staging_dir.join(chunk.entry_name()))
            .collect();
        let declared = manifest.tables.clone();

        if !job.critical_phase_entered {
            job.critical_phase_entered = true;
            job.log.info(
                &job.id,
                "restore_database",
                "TP-IMP-CRITICAL",
                "entering critical phase; failures from here on roll back",
            );
            self.save(job)?;
        }

        if !job.checkpoints.restore.snapshot_done {
            self.snapshot_tables(job, declared)?;
        }

        self.db.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (job_id TEXT PRIMARY KEY, file_index INTEGER NOT NULL, \
             line INTEGER NOT NULL, byte_offset INTEGER NOT NULL)",
            self.db.quote_identifier(PROGRESS_TABLE)
        ))?;
        self.adopt_recorded_progress(job)?;

        loop {
            let cp = &job.checkpoints.restore;
            let start = Position {
                file_index: cp.file_index,
                byte_offset: cp.byte_offset,
                line: cp.line,
            };
            if start.file_index >= files.len() {
                break;
            }
            if budget.exhausted() {
                return Ok(PhaseOutcome::Continue);
            }
            let (next, executed) = self.apply_batch(&job.id, &files[start.file_index], start)?;
            let cp = &mut job.checkpoints.restore;
            cp.file_index = next.file_index;
            cp.byte_offset = next.byte_offset;
            cp.line = next.line;
            cp.statements += executed;
            self.save(job)?;
            budget.tick();
        }

        job.checkpoints.restore.complete = true;
        job.log.info(
            &job.id,
            "restore_database",
            "TP-IMP-RESTORED",
            format!("{} statements applied", job.checkpoints.restore.statements),
        );
        Ok(PhaseOutcome::Complete)
    }

    /// Shadow-copy every table the package will rewrite. Tables that do not
    /// exist yet are recorded so rollback knows to drop them.
    fn snapshot_tables(&self, job: &mut ImportJob, declared: Vec<String>) -> EngineResult<()> {
        let tables = if declared.is_empty() {
            exportable_tables(self.db)?
        } else {
            declared
        };
        for table in tables.into_iter().filter(|t| !is_internal_table(t)) {
            if job.table_backups.contains_key(&table) {
                continue;
            }
            let backup = if self.db.table_exists(&table)? {
                let shadow = shadow_name(&job.id, &table);
                self.db.drop_table(&shadow)?;
                self.db.snapshot_table(&table, &shadow)?;
                TableBackup {
                    shadow: Some(shadow),
                    dependents: self.db.table_dependents(&table)?,
                    restored: false,
                }
            } else {
                TableBackup {
                    shadow: None,
                    dependents: Vec::new(),
                    restored: false,
                }
            };
            job.table_backups.insert(table, backup);
            self.save(job)?;
        }
        job.checkpoints.restore.snapshot_done = true;
        let count = job.table_backups.values().filter(|b| b.shadow.is_some()).count();
        job.log.info(
            &job.id,
            "restore_database",
            "TP-IMP-SNAPSHOT",
            format!("{count} tables snapshotted"),
        );
        self.save(job)
    }

    /// Move the checkpoint forward to the position committed in the
    /// database when the record lags behind it.
    fn adopt_recorded_progress(&self, job: &mut ImportJob) -> EngineResult<()> {
        let rows = self.db.fetch_rows(PROGRESS_TABLE, 0, 1000)?;
        let recorded = rows.iter().find_map(|row| match row.get("job_id") {
            Some(SqlValue::Text(id)) if *id == job.id => Some(Position {
                file_index: usize::try_from(integer(row.get("file_index"))?).ok()?,
                byte_offset: integer(row.get("byte_offset"))?,
                line: integer(row.get("line"))?,
            }),
            _ => None,
        });
        let Some(recorded) = recorded else {
            return Ok(());
        };
        let cp = &mut job.checkpoints.restore;
        let current = Position {
            file_index: cp.file_index,
            byte_offset: cp.byte_offset,
            line: cp.line,
        };
        if recorded > current {
            cp.file_index = recorded.file_index;
            cp.byte_offset = recorded.byte_offset;
            cp.line = recorded.line;
            job.log.info(
                &job.id,
                "restore_database",
                "TP-IMP-DB-ADOPT",
                format!(
                    "resuming from database marker: file {} line {}",
                    recorded.file_index, recorded.line
                ),
            );
            self.save(job)?;
        }
        Ok(())
    }

    /// Run up to `statements_per_batch` statements of one chunk in a single
    /// transaction together with the progress marker.
    fn apply_batch(
        &self,
        job_id: &str,
        file: &std::path::Path,
        start: Position,
    ) -> EngineResult<(Position, u64)> {
        self.db.begin()?;
        let result = self
            .apply_statements(job_id, file, start)
            .and_then(|outcome| {
                self.db.commit()?;
                Ok(outcome)
            });
        if result.is_err() {
            if let Err(err) = self.db.rollback_transaction() {
                tracing::warn!(job_id, error = %err, "[restore] transaction rollback failed");
            }
        }
        result
    }

    fn apply_statements(
        &self,
        job_id: &str,
        file: &std::path::Path,
        start: Position,
    ) -> EngineResult<(Position, u64)> {
        let limit = self.config.statements_per_batch.max(1);
        let mut reader = StatementReader::open(file, start.byte_offset, start.line)?;
        let mut position = start;
        let mut executed = 0u64;
        while executed < limit as u64 {
            match reader.next_statement()? {
                Some(statement) => {
                    self.db.execute(&statement.sql)?;
                    executed += 1;
                    position.byte_offset = statement.next_offset;
                    position.line = statement.next_line;
                }
                None => {
                    position = Position {
                        file_index: start.file_index + 1,
                        byte_offset: 0,
                        line: 0,
                    };
                    break;
                }
            }
        }
        let table = self.db.quote_identifier(PROGRESS_TABLE);
        let id = render_value(&SqlValue::Text(job_id.to_string()));
        self.db.execute(&format!(
            "DELETE FROM {table} WHERE job_id = {id};\n\
             INSERT INTO {table} (job_id, file_index, line, byte_offset) VALUES ({id}, {}, {}, {});",
            position.file_index, position.line, position.byte_offset
        ))?;
        Ok((position, executed))
    }

    /// Remove this job's progress marker, if the table exists.
    pub(super) fn clear_restore_progress(&self, job_id: &str) -> EngineResult<()> {
        if self.db.table_exists(PROGRESS_TABLE)? {
            self.db.execute(&format!(
                "DELETE FROM {} WHERE job_id = {}",
                self.db.quote_identifier(PROGRESS_TABLE),
                render_value(&SqlValue::Text(job_id.to_string()))
            ))?;
        }
        Ok(())
    }
}
