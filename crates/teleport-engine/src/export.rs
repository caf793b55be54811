//! Export engine.
//!
//! An export walks `enumerate → files → database → manifest → assemble`.
//! Every [`ExportEngine::advance`] call reloads the record, performs one
//! bounded batch and persists the record again; nothing is held between
//! calls.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use teleport_core::paths::write_file_atomic;
use teleport_core::{
    AccessGate, Config, Database, JobKind, JobLog, JobStore, LogLevel, ensure_job_id,
    load_record, new_job_id, save_record,
};
use teleport_package::{
    ChunkDescriptor, ChunkType, HEADER_ENTRY, Header, MANIFEST_ENTRY, Manifest, ManifestBuilder,
    Totals, append_entries, package_entry_names, sign_manifest,
};

use crate::budget::Budget;
use crate::chunker::write_file_chunk;
use crate::dump::{DumpCursor, DumpStep, Dumper, exportable_tables};
use crate::enumerate::{Enumerator, INDEX_FILE, IndexSummary, read_index_entry_at};
use crate::error::{EngineError, EngineResult};
use crate::job::{FailureAction, JobError, JobStatus, Timestamps, failure_action};
use crate::status::{JobReport, JobStatusView, ProgressCounts, ViewParts, band};
use crate::store::prune_history;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPhase {
    Enumerate,
    Files,
    Database,
    Manifest,
    Assemble,
    Done,
}

impl ExportPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enumerate => "enumerate",
            Self::Files => "files",
            Self::Database => "database",
            Self::Manifest => "manifest",
            Self::Assemble => "assemble",
            Self::Done => "done",
        }
    }
}

/// Position of the file chunk writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCursor {
    /// Byte position of the current entry in the index.
    pub index_pos: u64,
    /// Offset of the next chunk within the current file.
    pub file_offset: u64,
    pub files_done: u64,
    pub next_sequence: u64,
    pub bytes: u64,
}

/// Persisted export record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: String,
    pub status: JobStatus,
    pub phase: ExportPhase,
    pub base_dir: PathBuf,
    pub roots: Vec<PathBuf>,
    #[serde(flatten)]
    pub timestamps: Timestamps,
    #[serde(default)]
    pub index: IndexSummary,
    #[serde(default)]
    pub files: FileCursor,
    pub tables: Vec<String>,
    #[serde(default)]
    pub dump: DumpCursor,
    #[serde(default)]
    pub chunks: Vec<ChunkDescriptor>,
    #[serde(default)]
    pub global_hash: Option<String>,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub package_path: Option<PathBuf>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub last_error: Option<JobError>,
    #[serde(default)]
    pub log: JobLog,
}

impl ExportJob {
    fn progress(&self) -> u8 {
        match self.phase {
            ExportPhase::Enumerate => 0,
            ExportPhase::Files => band(5, 60, self.files.files_done, self.index.files),
            ExportPhase::Database => band(
                60,
                85,
                self.dump.table_index as u64,
                self.tables.len() as u64,
            ),
            ExportPhase::Manifest => 85,
            ExportPhase::Assemble => 90,
            ExportPhase::Done => 100,
        }
    }

    #[must_use]
    pub fn view(&self) -> JobStatusView {
        let sealed = matches!(self.phase, ExportPhase::Assemble | ExportPhase::Done);
        ViewParts {
            id: &self.id,
            kind: JobKind::Export,
            status: self.status,
            phase: self.phase.as_str(),
            progress: self.progress(),
            counts: ProgressCounts {
                chunks_done: self.chunks.len() as u64,
                chunks_total: if sealed { self.chunks.len() as u64 } else { 0 },
                tables_done: self.dump.table_index.min(self.tables.len()) as u64,
                tables_total: self.tables.len() as u64,
                rows: self.dump.rows_dumped,
                bytes: self.files.bytes,
                statements: self.dump.statements,
            },
            last_error: self.last_error.as_ref(),
            download: self
                .package_path
                .as_ref()
                .filter(|_| self.status == JobStatus::Completed)
                .map(|p| p.display().to_string()),
            retries: self.retries,
            timestamps: &self.timestamps,
        }
        .into_view()
    }

    #[must_use]
    pub fn report(&self) -> JobReport {
        JobReport {
            job: self.view(),
            summary: json!({
                "phase": self.phase.as_str(),
                "files_indexed": self.index.files,
                "bytes_indexed": self.index.bytes,
                "files_done": self.files.files_done,
                "tables": self.tables,
                "rows": self.dump.rows_dumped,
                "chunks": self.chunks.len(),
                "global_hash": self.global_hash,
                "signed": self.signed,
            }),
            log: self.log.entries().cloned().collect(),
        }
    }
}

/// Drives export jobs against the host's database and job store.
pub struct ExportEngine<'a> {
    config: &'a Config,
    db: &'a dyn Database,
    store: &'a dyn JobStore,
    gate: &'a dyn AccessGate,
}

impl<'a> ExportEngine<'a> {
    pub fn new(
        config: &'a Config,
        db: &'a dyn Database,
        store: &'a dyn JobStore,
        gate: &'a dyn AccessGate,
    ) -> Self {
        Self {
            config,
            db,
            store,
            gate,
        }
    }

    fn authorize(&self) -> EngineResult<()> {
        if self.gate.is_authorized() {
            Ok(())
        } else {
            Err(EngineError::AccessDenied)
        }
    }

    fn load(&self, id: &str) -> EngineResult<ExportJob> {
        ensure_job_id(id)?;
        Ok(load_record(self.store, JobKind::Export, id)?)
    }

    fn save(&self, job: &mut ExportJob) -> EngineResult<()> {
        job.timestamps.touch();
        save_record(self.store, JobKind::Export, &job.id, &*job)?;
        Ok(())
    }

    fn work_dir(&self, id: &str) -> PathBuf {
        self.config.export_work_dir(id)
    }

    /// Where the finished package of `id` is written.
    #[must_use]
    pub fn package_path(&self, id: &str) -> PathBuf {
        self.config.packages_dir().join(format!("teleport-{id}.zip"))
    }

    /// Create a new export of `roots` (relative to `base`, all of `base`
    /// when empty).
    pub fn start(&self, base: &Path, roots: &[PathBuf]) -> EngineResult<JobStatusView> {
        self.authorize()?;
        let pruned = prune_history(self.store, JobKind::Export, self.config.history_limit, |_| false)?;
        if !pruned.is_empty() {
            tracing::debug!(count = pruned.len(), "[export] pruned history");
        }
        let id = new_job_id()?;
        let mut job = ExportJob {
            id: id.clone(),
            status: JobStatus::Running,
            phase: ExportPhase::Enumerate,
            base_dir: std::path::absolute(base)?,
            roots: roots.to_vec(),
            timestamps: Timestamps::now(),
            index: IndexSummary::default(),
            files: FileCursor::default(),
            tables: exportable_tables(self.db)?,
            dump: DumpCursor::default(),
            chunks: Vec::new(),
            global_hash: None,
            signed: false,
            package_path: None,
            retries: 0,
            last_error: None,
            log: JobLog::new(),
        };
        job.log.info(
            &id,
            "start",
            "TP-EXP-START",
            format!(
                "export of {} with {} tables",
                job.base_dir.display(),
                job.tables.len()
            ),
        );
        self.save(&mut job)?;
        Ok(job.view())
    }

    /// Perform one bounded batch of work.
    ///
    /// Job-level failures are recorded on the record and reflected in the
    /// returned view; `Err` means the call itself could not be served.
    pub fn advance(&self, id: &str) -> EngineResult<JobStatusView> {
        self.authorize()?;
        let mut job = self.load(id)?;
        if job.status != JobStatus::Running {
            return Ok(job.view());
        }
        let mut budget = Budget::from_config(self.config);
        match self.run_batch(&mut job, &mut budget) {
            Ok(()) => {
                job.retries = 0;
                job.last_error = None;
            }
            Err(err) => self.record_failure(&mut job, &err),
        }
        self.save(&mut job)?;
        Ok(job.view())
    }

    fn run_batch(&self, job: &mut ExportJob, budget: &mut Budget) -> EngineResult<()> {
        let work = self.work_dir(&job.id);
        if job.phase == ExportPhase::Database {
            self.dumper(&work).reconcile(&job.dump)?;
        }
        while !budget.exhausted() {
            match job.phase {
                ExportPhase::Enumerate => self.enumerate(job, &work)?,
                ExportPhase::Files => self.files_step(job, &work)?,
                ExportPhase::Database => self.database_step(job, &work)?,
                ExportPhase::Manifest => self.write_manifest(job, &work)?,
                ExportPhase::Assemble => self.assemble(job, &work, budget)?,
                ExportPhase::Done => break,
            }
            budget.tick();
        }
        Ok(())
    }

    fn dumper<'w>(&self, work: &'w Path) -> Dumper<'w>
    where
        'a: 'w,
    {
        Dumper {
            db: self.db,
            work_dir: work,
            chunk_size: self.config.chunk_size,
            rows_per_window: self.config.rows_per_window,
        }
    }

    fn enumerate(&self, job: &mut ExportJob, work: &Path) -> EngineResult<()> {
        let skip = [std::path::absolute(&self.config.data_dir)?];
        let enumerator = Enumerator {
            base: &job.base_dir,
            roots: &job.roots,
            skip_dirs: &skip,
            excludes: &self.config.export_excludes,
        };
        job.index = enumerator.write_index(&work.join(INDEX_FILE))?;
        job.phase = ExportPhase::Files;
        job.log.info(
            &job.id,
            "enumerate",
            "TP-EXP-ENUM-DONE",
            format!("indexed {} files, {} bytes", job.index.files, job.index.bytes),
        );
        Ok(())
    }

    fn files_step(&self, job: &mut ExportJob, work: &Path) -> EngineResult<()> {
        let Some((entry, next_pos)) = read_index_entry_at(&work.join(INDEX_FILE), job.files.index_pos)?
        else {
            job.phase = ExportPhase::Database;
            job.log.info(
                &job.id,
                "files",
                "TP-EXP-FILES-DONE",
                format!("{} file chunks written", job.files.next_sequence),
            );
            return Ok(());
        };
        let cut = write_file_chunk(
            &job.base_dir,
            work,
            &entry,
            job.files.file_offset,
            job.files.next_sequence,
            self.config.chunk_size,
        )?;
        match cut {
            Some(cut) => {
                job.files.next_sequence += 1;
                job.files.bytes += cut.chunk.size;
                job.chunks.push(cut.chunk);
                if cut.file_done {
                    job.files.index_pos = next_pos;
                    job.files.file_offset = 0;
                    job.files.files_done += 1;
                } else {
                    job.files.file_offset = cut.next_offset;
                }
            }
            None => {
                job.log.push(
                    &job.id,
                    LogLevel::Warning,
                    "files",
                    "TP-EXP-FILE-VANISHED",
                    format!("{} disappeared before it was read", entry.path),
                    json!({ "path": entry.path }),
                );
                job.files.index_pos = next_pos;
                job.files.file_offset = 0;
                job.files.files_done += 1;
            }
        }
        Ok(())
    }

    fn database_step(&self, job: &mut ExportJob, work: &Path) -> EngineResult<()> {
        match self.dumper(work).step(&job.tables, &mut job.dump)? {
            DumpStep::Progress(closed) => job.chunks.extend(closed),
            DumpStep::Finished(closed) => {
                job.chunks.extend(closed);
                job.phase = ExportPhase::Manifest;
                job.log.info(
                    &job.id,
                    "database",
                    "TP-EXP-DB-DONE",
                    format!(
                        "{} rows from {} tables",
                        job.dump.rows_dumped,
                        job.tables.len()
                    ),
                );
            }
        }
        Ok(())
    }

    fn write_manifest(&self, job: &mut ExportJob, work: &Path) -> EngineResult<()> {
        if job.chunks.is_empty() {
            return Err(EngineError::InvalidState(
                "nothing to export: no files and no tables".into(),
            ));
        }
        let file_count = job
            .chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::Filesystem)
            .map(|c| c.path.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len() as u64;
        let totals = Totals {
            file_count,
            file_bytes: job.files.bytes,
            row_count: job.dump.rows_dumped,
        };
        let mut manifest = ManifestBuilder::new(&self.config.environment, job.timestamps.created_at)
            .chunks(job.chunks.iter().cloned())
            .tables(job.tables.clone())
            .totals(totals)
            .build();
        if let Some(key) = &self.config.signing_key_path {
            sign_manifest(&mut manifest, key)?;
            job.signed = true;
        }
        let manifest_bytes = manifest
            .to_json_bytes()
            .map_err(teleport_core::Error::from)?;
        let header_bytes = serde_json::to_vec_pretty(&Header::new(job.timestamps.created_at))
            .map_err(teleport_core::Error::from)?;
        write_file_atomic(&work.join(HEADER_ENTRY), &header_bytes)?;
        write_file_atomic(&work.join(MANIFEST_ENTRY), &manifest_bytes)?;
        job.global_hash = Some(manifest.integrity.global_hash.clone());
        job.phase = ExportPhase::Assemble;
        job.log.info(
            &job.id,
            "manifest",
            "TP-EXP-MANIFEST",
            format!(
                "manifest sealed with {} chunks ({})",
                manifest.chunks.len(),
                manifest.integrity.global_hash
            ),
        );
        Ok(())
    }

    fn assemble(&self, job: &mut ExportJob, work: &Path, budget: &mut Budget) -> EngineResult<()> {
        let manifest: Manifest = serde_json::from_slice(&fs::read(work.join(MANIFEST_ENTRY))?)
            .map_err(teleport_core::Error::from)?;
        let names = package_entry_names(&manifest);
        let dest = self.package_path(&job.id);
        let complete = append_entries(&dest, work, &names, || {
            budget.tick();
            !budget.exhausted()
        })?;
        if complete {
            remove_dir_logged(work);
            job.package_path = Some(dest);
            job.phase = ExportPhase::Done;
            job.status = JobStatus::Completed;
            job.timestamps.finish();
            job.log.info(
                &job.id,
                "assemble",
                "TP-EXP-DONE",
                format!("package written with {} entries", names.len()),
            );
        }
        Ok(())
    }

    fn record_failure(&self, job: &mut ExportJob, err: &EngineError) {
        let phase = job.phase.as_str();
        match failure_action(err, &mut job.retries, self.config.max_retries) {
            FailureAction::Retry => {
                job.last_error = Some(JobError::from_engine(err, true));
                job.log.push(
                    &job.id,
                    LogLevel::Warning,
                    phase,
                    "TP-EXP-RETRY",
                    err.to_string(),
                    json!({ "attempt": job.retries, "code": err.code() }),
                );
            }
            FailureAction::Fail => self.fail(job, err),
            FailureAction::Exhausted => {
                let exhausted = EngineError::RetriesExhausted {
                    attempts: job.retries,
                    last: err.to_string(),
                };
                self.fail(job, &exhausted);
            }
        }
    }

    fn fail(&self, job: &mut ExportJob, err: &EngineError) {
        job.status = JobStatus::Failed;
        job.last_error = Some(JobError::from_engine(err, false));
        job.log.error(
            &job.id,
            job.phase.as_str(),
            "TP-EXP-FAILED",
            err.to_string(),
            json!({ "code": err.code(), "class": err.class() }),
        );
        job.timestamps.finish();
        self.discard_artifacts(&job.id);
    }

    fn discard_artifacts(&self, id: &str) {
        remove_dir_logged(&self.work_dir(id));
        let package = self.package_path(id);
        if package.exists() {
            if let Err(e) = fs::remove_file(&package) {
                tracing::warn!(path = %package.display(), "[export] could not remove partial package: {e}");
            }
        }
    }

    pub fn pause(&self, id: &str) -> EngineResult<JobStatusView> {
        self.authorize()?;
        let mut job = self.load(id)?;
        if job.status != JobStatus::Running {
            return Err(EngineError::InvalidState(format!("export {id} is {}", job.status)));
        }
        job.status = JobStatus::Paused;
        job.log.info(id, job.phase.as_str(), "TP-EXP-PAUSED", "paused");
        self.save(&mut job)?;
        Ok(job.view())
    }

    pub fn resume(&self, id: &str) -> EngineResult<JobStatusView> {
        self.authorize()?;
        let mut job = self.load(id)?;
        if job.status != JobStatus::Paused {
            return Err(EngineError::InvalidState(format!("export {id} is {}", job.status)));
        }
        job.status = JobStatus::Running;
        job.log.info(id, job.phase.as_str(), "TP-EXP-RESUMED", "resumed");
        self.save(&mut job)?;
        Ok(job.view())
    }

    /// Cancel a running or paused export, deleting its work directory and
    /// any partial package.
    pub fn cancel(&self, id: &str) -> EngineResult<JobStatusView> {
        self.authorize()?;
        let mut job = self.load(id)?;
        if job.status.is_finished() {
            return Err(EngineError::InvalidState(format!("export {id} is {}", job.status)));
        }
        self.discard_artifacts(id);
        job.status = JobStatus::Cancelled;
        job.timestamps.finish();
        job.log.info(id, job.phase.as_str(), "TP-EXP-CANCELLED", "cancelled");
        self.save(&mut job)?;
        Ok(job.view())
    }

    pub fn status(&self, id: &str) -> EngineResult<JobStatusView> {
        self.authorize()?;
        Ok(self.load(id)?.view())
    }

    /// Views of every retained export, newest first.
    pub fn list(&self) -> EngineResult<Vec<JobStatusView>> {
        self.authorize()?;
        let mut views = Vec::new();
        for id in self.store.list(JobKind::Export)? {
            views.push(self.load(&id)?.view());
        }
        views.sort_by(|a, b| b.timestamps.created_at.cmp(&a.timestamps.created_at));
        Ok(views)
    }

    pub fn report(&self, id: &str) -> EngineResult<JobReport> {
        self.authorize()?;
        Ok(self.load(id)?.report())
    }
}

pub(crate) fn remove_dir_logged(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %dir.display(), "could not remove directory: {e}"),
    }
}
