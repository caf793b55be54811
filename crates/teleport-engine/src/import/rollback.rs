//! Rollback: put tables and files back the way they were before the
//! critical phase. Every step is recorded as it completes, so a rollback
//! interrupted halfway can be re-run.

use std::fs;

use teleport_core::paths::{join_relative, move_path, remove_dir_if_empty};

use super::{ImportEngine, ImportJob, Phase};
use crate::error::{EngineError, EngineResult};
use crate::export::remove_dir_logged;

fn rollback_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::RollbackFailed(err.to_string())
}

impl ImportEngine<'_> {
    pub(super) fn roll_back(&self, job: &mut ImportJob) -> EngineResult<()> {
        job.phase = Phase::Rollback;
        job.rollback.attempts += 1;
        tracing::warn!(
            job_id = %job.id,
            attempt = job.rollback.attempts,
            "[rollback] restoring pre-import state"
        );
        self.save(job).map_err(rollback_err)?;

        let pending: Vec<String> = job
            .table_backups
            .iter()
            .filter(|(_, b)| !b.restored)
            .map(|(table, _)| table.clone())
            .collect();
        for table in pending {
            let Some(backup) = job.table_backups.get(&table).cloned() else {
                continue;
            };
            match backup.shadow {
                Some(shadow) => {
                    if self.db.table_exists(&shadow).map_err(rollback_err)? {
                        self.reinstate_table(&shadow, &table, &backup.dependents)
                            .map_err(rollback_err)?;
                    } else if !self.db.table_exists(&table).map_err(rollback_err)? {
                        return Err(EngineError::RollbackFailed(format!(
                            "snapshot of {table} is gone"
                        )));
                    }
                }
                None => self.db.drop_table(&table).map_err(rollback_err)?,
            }
            if let Some(backup) = job.table_backups.get_mut(&table) {
                backup.restored = true;
            }
            self.save(job).map_err(rollback_err)?;
        }

        for index in (0..job.file_backups.len()).rev() {
            if job.file_backups[index].restored {
                continue;
            }
            let entry = job.file_backups[index].clone();
            let live = join_relative(&job.target_root, &entry.target);
            match &entry.backup {
                Some(rel) => {
                    let saved = join_relative(&job.backup_dir, rel);
                    if saved.exists() {
                        if live.is_file() {
                            fs::remove_file(&live).map_err(rollback_err)?;
                        }
                        move_path(&saved, &live).map_err(rollback_err)?;
                    }
                }
                None => {
                    if live.is_file() {
                        fs::remove_file(&live).map_err(rollback_err)?;
                    }
                }
            }
            for dir in entry.created_dirs.iter().rev() {
                remove_dir_if_empty(&join_relative(&job.target_root, dir)).map_err(rollback_err)?;
            }
            job.file_backups[index].restored = true;
            self.save(job).map_err(rollback_err)?;
        }

        self.clear_restore_progress(&job.id).map_err(rollback_err)?;
        remove_dir_logged(&job.staging_dir);
        job.rollback.complete = true;
        job.log.info(
            &job.id,
            Phase::Rollback.as_str(),
            "TP-IMP-ROLLBACK-DONE",
            format!(
                "{} tables and {} files restored",
                job.table_backups.len(),
                job.file_backups.len()
            ),
        );
        self.save(job).map_err(rollback_err)
    }

    /// Rename the shadow over the live table and recreate the table's
    /// indexes and triggers, all in one transaction.
    fn reinstate_table(
        &self,
        shadow: &str,
        table: &str,
        dependents: &[String],
    ) -> teleport_core::Result<()> {
        self.db.begin()?;
        let result = self
            .db
            .restore_table(shadow, table)
            .and_then(|()| dependents.iter().try_for_each(|sql| self.db.execute(sql)))
            .and_then(|()| self.db.commit());
        if result.is_err() {
            if let Err(err) = self.db.rollback_transaction() {
                tracing::warn!(table, error = %err, "[rollback] transaction rollback failed");
            }
        }
        result
    }
}
