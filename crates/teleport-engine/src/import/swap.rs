//! `swap_files`: move staged files into the target tree, keeping the
//! previous versions under the job's backup directory.
//!
//! The backup intent for a path is persisted before anything moves, so a
//! crash mid-swap leaves enough on record for rollback.

use std::path::PathBuf;

use teleport_core::paths::{
    join_relative, missing_parent_dirs, move_path, normalize_relative_path,
};

use super::stage::STAGED_FILES_DIR;
use super::{FileBackup, ImportEngine, ImportJob, PhaseOutcome, loaded_manifest};
use crate::budget::Budget;
use crate::error::{EngineError, EngineResult};

impl ImportEngine<'_> {
    pub(super) fn swap_files(
        &self,
        job: &mut ImportJob,
        budget: &mut Budget,
    ) -> EngineResult<PhaseOutcome> {
        if job.checkpoints.swap.complete {
            return Ok(PhaseOutcome::Complete);
        }
        let paths = loaded_manifest(job.manifest.as_ref())?.file_paths();
        let staged_root: PathBuf = job.staging_dir.join(STAGED_FILES_DIR);

        while let Some(raw) = paths.get(job.checkpoints.swap.next_file) {
            if budget.exhausted() {
                return Ok(PhaseOutcome::Continue);
            }
            let rel = normalize_relative_path(raw)?;
            let live = join_relative(&job.target_root, &rel);
            let staged = join_relative(&staged_root, &rel);
            let backup_path = join_relative(&job.backup_dir, &rel);

            let index = match job.file_backups.iter().position(|b| b.target == rel) {
                Some(index) => index,
                None => {
                    job.file_backups.push(FileBackup {
                        target: rel.clone(),
                        backup: live.exists().then(|| rel.clone()),
                        created_dirs: missing_parent_dirs(&job.target_root, &rel),
                        swapped: false,
                        restored: false,
                    });
                    self.save(job)?;
                    job.file_backups.len() - 1
                }
            };

            if job.file_backups[index].backup.is_some() && live.exists() && !backup_path.exists() {
                move_path(&live, &backup_path)?;
            }
            if staged.exists() {
                move_path(&staged, &live)?;
            } else if !live.exists() {
                return Err(EngineError::InvalidState(format!(
                    "staged copy of {rel} is missing"
                )));
            }

            job.file_backups[index].swapped = true;
            job.checkpoints.swap.next_file += 1;
            self.save(job)?;
            budget.tick();
        }

        job.checkpoints.swap.complete = true;
        job.log.info(
            &job.id,
            "swap_files",
            "TP-IMP-SWAPPED",
            format!("{} files swapped into place", job.file_backups.len()),
        );
        Ok(PhaseOutcome::Complete)
    }
}
