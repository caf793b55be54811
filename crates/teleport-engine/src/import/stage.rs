//! `stage_files`: extract chunks into the job's staging directory.
//!
//! Filesystem chunks are written at their offset under `files/`, database
//! chunks under `sql/`. Every chunk is re-hashed while it is written.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use teleport_core::paths::{join_relative, normalize_relative_path};
use teleport_package::{ChunkDescriptor, ChunkType, PackageReader, check_chunk_bytes};

use super::{ImportEngine, ImportJob, PhaseOutcome, loaded_manifest};
use crate::budget::Budget;
use crate::error::EngineResult;

pub(super) const STAGED_FILES_DIR: &str = "files";

fn stage_chunk(reader: &mut PackageReader, staging: &Path, chunk: &ChunkDescriptor) -> EngineResult<()> {
    let mut file = match chunk.chunk_type {
        ChunkType::Filesystem => {
            let rel = normalize_relative_path(&chunk.path)?;
            let dest = join_relative(&staging.join(STAGED_FILES_DIR), &rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&dest)?;
            file.seek(SeekFrom::Start(chunk.offset.unwrap_or(0)))?;
            file
        }
        ChunkType::Database => {
            let dest = staging.join(chunk.entry_name());
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            File::create(&dest)?
        }
    };
    let (digest, len) = reader.copy_entry(&chunk.entry_name(), &mut file)?;
    check_chunk_bytes(chunk, &digest, len)?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

impl ImportEngine<'_> {
    pub(super) fn stage_files(
        &self,
        job: &mut ImportJob,
        budget: &mut Budget,
    ) -> EngineResult<PhaseOutcome> {
        if job.checkpoints.stage.complete {
            return Ok(PhaseOutcome::Complete);
        }
        let manifest = loaded_manifest(job.manifest.as_ref())?;
        let chunks: Vec<&ChunkDescriptor> = manifest
            .filesystem_chunks()
            .into_iter()
            .chain(manifest.database_chunks())
            .collect();
        let mut reader = PackageReader::open(&job.archive_path)?;
        let cp = &mut job.checkpoints.stage;
        while let Some(chunk) = chunks.get(cp.next_chunk) {
            if budget.exhausted() {
                return Ok(PhaseOutcome::Continue);
            }
            stage_chunk(&mut reader, &job.staging_dir, chunk)?;
            if chunk.chunk_type == ChunkType::Filesystem {
                cp.staged_bytes += chunk.size;
            }
            cp.next_chunk += 1;
            budget.tick();
        }
        cp.complete = true;
        tracing::debug!(
            job_id = %job.id,
            bytes = cp.staged_bytes,
            "[stage] all chunks staged"
        );
        Ok(PhaseOutcome::Complete)
    }
}
