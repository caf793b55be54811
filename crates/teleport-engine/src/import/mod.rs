//! Import phase engine.
//!
//! An import is a checkpointed state machine:
//!
//! ```text
//! parse_manifest → stage_files → validate_environment
//!     → restore_database → swap_files → finalize → done
//! ```
//!
//! plus `rollback`. Each phase is re-enterable from its checkpoint alone.
//! `restore_database` and `swap_files` are the only phases that touch live
//! data; entering the first of them sets `critical_phase_entered`, after
//! which any terminal failure rolls the target back from its snapshots.

mod environment;
mod parse;
mod restore;
mod rollback;
mod stage;
mod swap;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use teleport_core::{
    AccessGate, Config, Database, JobKind, JobLog, JobStore, LogLevel, TELEPORT_VERSION, Version,
    ensure_job_id, load_record, new_job_id, save_record,
};
use teleport_package::{Manifest, PackageError};

use crate::budget::Budget;
use crate::error::{EngineError, EngineResult};
use crate::export::remove_dir_logged;
use crate::job::{FailureAction, JobError, JobStatus, Timestamps, failure_action};
use crate::status::{JobReport, JobStatusView, ProgressCounts, ViewParts, band};
use crate::store::prune_history;

pub use restore::PROGRESS_TABLE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ParseManifest,
    StageFiles,
    ValidateEnvironment,
    RestoreDatabase,
    SwapFiles,
    Finalize,
    Done,
    Rollback,
}

impl Phase {
    /// Forward order of the phase list.
    pub const ORDER: [Self; 7] = [
        Self::ParseManifest,
        Self::StageFiles,
        Self::ValidateEnvironment,
        Self::RestoreDatabase,
        Self::SwapFiles,
        Self::Finalize,
        Self::Done,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParseManifest => "parse_manifest",
            Self::StageFiles => "stage_files",
            Self::ValidateEnvironment => "validate_environment",
            Self::RestoreDatabase => "restore_database",
            Self::SwapFiles => "swap_files",
            Self::Finalize => "finalize",
            Self::Done => "done",
            Self::Rollback => "rollback",
        }
    }

    /// Phase that follows a completed `self`.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::ParseManifest => Self::StageFiles,
            Self::StageFiles => Self::ValidateEnvironment,
            Self::ValidateEnvironment => Self::RestoreDatabase,
            Self::RestoreDatabase => Self::SwapFiles,
            Self::SwapFiles => Self::Finalize,
            Self::Finalize | Self::Done => Self::Done,
            Self::Rollback => Self::Rollback,
        }
    }

    /// Whether the phase writes to live tables or files.
    #[must_use]
    pub const fn is_mutating(self) -> bool {
        matches!(self, Self::RestoreDatabase | Self::SwapFiles)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseCheckpoint {
    /// Chunks whose archive digest has been re-verified.
    pub verified: usize,
    pub complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCheckpoint {
    pub next_chunk: usize,
    pub staged_bytes: u64,
    pub complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentCheckpoint {
    pub complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreCheckpoint {
    pub snapshot_done: bool,
    /// Index into the manifest's database chunks.
    pub file_index: usize,
    pub line: u64,
    pub byte_offset: u64,
    pub statements: u64,
    pub complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapCheckpoint {
    pub next_file: usize,
    pub complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoints {
    pub parse: ParseCheckpoint,
    pub stage: StageCheckpoint,
    pub environment: EnvironmentCheckpoint,
    pub restore: RestoreCheckpoint,
    pub swap: SwapCheckpoint,
}

/// One live path touched (or about to be touched) by `swap_files`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBackup {
    /// Path relative to the target root.
    pub target: String,
    /// Path of the previous version relative to the backup directory;
    /// `None` when the target did not exist before the swap.
    pub backup: Option<String>,
    /// Directories (relative to the target root, shallowest first) the swap
    /// had to create for this path.
    #[serde(default)]
    pub created_dirs: Vec<String>,
    pub swapped: bool,
    pub restored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableBackup {
    /// Shadow copy of the table; `None` when the table did not exist.
    pub shadow: Option<String>,
    /// Index and trigger definitions of the live table at snapshot time,
    /// replayed once the shadow is renamed back.
    #[serde(default)]
    pub dependents: Vec<String>,
    pub restored: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackState {
    pub attempts: u32,
    pub complete: bool,
}

/// Persisted import record; the sole source of truth for resumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: String,
    pub status: JobStatus,
    pub phase: Phase,
    pub archive_path: PathBuf,
    pub target_root: PathBuf,
    pub staging_dir: PathBuf,
    pub backup_dir: PathBuf,
    #[serde(flatten)]
    pub timestamps: Timestamps,
    #[serde(default)]
    pub checkpoints: Checkpoints,
    #[serde(default)]
    pub manifest: Option<Manifest>,
    /// Base64 key the manifest signature verified against.
    #[serde(default)]
    pub signer: Option<String>,
    #[serde(default)]
    pub retries: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub critical_phase_entered: bool,
    #[serde(default)]
    pub file_backups: Vec<FileBackup>,
    #[serde(default)]
    pub table_backups: BTreeMap<String, TableBackup>,
    #[serde(default)]
    pub rollback: RollbackState,
    #[serde(default)]
    pub backups_discarded: bool,
    #[serde(default)]
    pub last_error: Option<JobError>,
    #[serde(default)]
    pub log: JobLog,
}

/// The manifest recorded by `parse_manifest`; later phases cannot run
/// without it.
fn loaded_manifest(manifest: Option<&Manifest>) -> EngineResult<&Manifest> {
    manifest.ok_or_else(|| EngineError::InvalidState("manifest not loaded".into()))
}

impl ImportJob {
    /// Shadow tables or file backups of this job are still on the target
    /// and only this record knows about them.
    #[must_use]
    pub const fn holds_backups(&self) -> bool {
        self.critical_phase_entered && !self.backups_discarded && !self.rollback.complete
    }

    fn chunk_total(&self) -> u64 {
        self.manifest.as_ref().map_or(0, |m| m.chunks.len() as u64)
    }

    fn progress(&self) -> u8 {
        let cp = &self.checkpoints;
        let manifest = self.manifest.as_ref();
        match self.phase {
            Phase::ParseManifest => band(0, 10, cp.parse.verified as u64, self.chunk_total()),
            Phase::StageFiles => band(10, 40, cp.stage.next_chunk as u64, self.chunk_total()),
            Phase::ValidateEnvironment => 40,
            Phase::RestoreDatabase => band(
                45,
                75,
                cp.restore.file_index as u64,
                manifest.map_or(0, |m| m.database_chunks().len() as u64),
            ),
            Phase::SwapFiles => band(
                75,
                95,
                cp.swap.next_file as u64,
                manifest.map_or(0, |m| m.file_paths().len() as u64),
            ),
            Phase::Finalize | Phase::Rollback => 95,
            Phase::Done => 100,
        }
    }

    #[must_use]
    pub fn view(&self) -> JobStatusView {
        let cp = &self.checkpoints;
        let tables_total = self.manifest.as_ref().map_or(0, |m| m.tables.len() as u64);
        let chunks_done = if cp.parse.complete {
            cp.stage.next_chunk as u64
        } else {
            cp.parse.verified as u64
        };
        ViewParts {
            id: &self.id,
            kind: JobKind::Import,
            status: self.status,
            phase: self.phase.as_str(),
            progress: self.progress(),
            counts: ProgressCounts {
                chunks_done,
                chunks_total: self.chunk_total(),
                tables_done: if cp.restore.complete { tables_total } else { 0 },
                tables_total,
                rows: self
                    .manifest
                    .as_ref()
                    .and_then(|m| m.totals.as_ref())
                    .filter(|_| cp.restore.complete)
                    .map_or(0, |t| t.row_count),
                bytes: cp.stage.staged_bytes,
                statements: cp.restore.statements,
            },
            last_error: self.last_error.as_ref(),
            download: None,
            retries: self.retries,
            timestamps: &self.timestamps,
        }
        .into_view()
    }

    #[must_use]
    pub fn report(&self) -> JobReport {
        let manifest = self.manifest.as_ref();
        JobReport {
            job: self.view(),
            summary: json!({
                "phase": self.phase.as_str(),
                "archive": self.archive_path.file_name().map(|n| n.to_string_lossy()),
                "exporter_version": manifest.and_then(|m| m.exporter_version.clone()),
                "format_version": manifest.map(|m| m.format_version.clone()),
                "chunks": self.chunk_total(),
                "tables": manifest.map(|m| m.tables.clone()),
                "global_hash": manifest.map(|m| m.integrity.global_hash.clone()),
                "signed_by": self.signer,
                "critical_phase_entered": self.critical_phase_entered,
                "rollback_attempts": self.rollback.attempts,
                "rollback_complete": self.rollback.complete,
                "backups_discarded": self.backups_discarded,
            }),
            log: self.log.entries().cloned().collect(),
        }
    }
}

/// What a phase call achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhaseOutcome {
    /// Budget ran out with work left in the phase.
    Continue,
    Complete,
}

/// Drives import jobs against the host's database and job store.
pub struct ImportEngine<'a> {
    config: &'a Config,
    db: &'a dyn Database,
    store: &'a dyn JobStore,
    gate: &'a dyn AccessGate,
    importer_version: Version,
    trusted_key: Option<String>,
}

impl<'a> ImportEngine<'a> {
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
            importer_version: TELEPORT_VERSION
                .parse()
                .unwrap_or(Version::new(0, 0, 0)),
            trusted_key: None,
        }
    }

    /// Check packages against `version` instead of this build's version.
    #[must_use]
    pub const fn with_importer_version(mut self, version: Version) -> Self {
        self.importer_version = version;
        self
    }

    /// Require manifest signatures to verify against this base64 key.
    #[must_use]
    pub fn with_trusted_key(mut self, key: impl Into<String>) -> Self {
        self.trusted_key = Some(key.into());
        self
    }

    fn authorize(&self) -> EngineResult<()> {
        if self.gate.is_authorized() {
            Ok(())
        } else {
            Err(EngineError::AccessDenied)
        }
    }

    fn load(&self, id: &str) -> EngineResult<ImportJob> {
        ensure_job_id(id)?;
        Ok(load_record(self.store, JobKind::Import, id)?)
    }

    fn save(&self, job: &mut ImportJob) -> EngineResult<()> {
        job.timestamps.touch();
        save_record(self.store, JobKind::Import, &job.id, &*job)?;
        Ok(())
    }

    /// Register an import of `archive` into `target_root`. No package bytes
    /// are read until the first `advance`.
    pub fn start(&self, archive: &Path, target_root: &Path) -> EngineResult<JobStatusView> {
        self.authorize()?;
        if !archive.is_file() {
            return Err(PackageError::PackageNotFound {
                path: archive.display().to_string(),
            }
            .into());
        }
        if !target_root.is_dir() {
            return Err(EngineError::InvalidState(format!(
                "target root {} is not a directory",
                target_root.display()
            )));
        }
        let pruned = prune_history(self.store, JobKind::Import, self.config.history_limit, |record| {
            serde_json::from_value::<ImportJob>(record.clone()).map_or(true, |job| job.holds_backups())
        })?;
        if !pruned.is_empty() {
            tracing::debug!(count = pruned.len(), "[import] pruned history");
        }
        let id = new_job_id()?;
        let mut job = ImportJob {
            id: id.clone(),
            status: JobStatus::Running,
            phase: Phase::ParseManifest,
            archive_path: std::path::absolute(archive)?,
            target_root: std::path::absolute(target_root)?,
            staging_dir: self.config.staging_dir(&id),
            backup_dir: self.config.backup_dir(&id),
            timestamps: Timestamps::now(),
            checkpoints: Checkpoints::default(),
            manifest: None,
            signer: None,
            retries: 0,
            max_retries: self.config.max_retries,
            critical_phase_entered: false,
            file_backups: Vec::new(),
            table_backups: BTreeMap::new(),
            rollback: RollbackState::default(),
            backups_discarded: false,
            last_error: None,
            log: JobLog::new(),
        };
        job.log.info(
            &id,
            "start",
            "TP-IMP-START",
            format!("import of {}", job.archive_path.display()),
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
            Err(err) => self.handle_failure(&mut job, &err),
        }
        self.save(&mut job)?;
        Ok(job.view())
    }

    fn run_batch(&self, job: &mut ImportJob, budget: &mut Budget) -> EngineResult<()> {
        while job.status == JobStatus::Running && !budget.exhausted() {
            let phase = job.phase;
            let outcome = match phase {
                Phase::ParseManifest => self.parse_manifest(job, budget)?,
                Phase::StageFiles => self.stage_files(job, budget)?,
                Phase::ValidateEnvironment => self.validate_environment(job)?,
                Phase::RestoreDatabase => self.restore_database(job, budget)?,
                Phase::SwapFiles => self.swap_files(job, budget)?,
                Phase::Finalize => self.finalize(job)?,
                Phase::Done | Phase::Rollback => break,
            };
            if outcome == PhaseOutcome::Complete && job.phase == phase {
                job.phase = phase.next();
                job.log.info(
                    &job.id,
                    phase.as_str(),
                    "TP-IMP-PHASE-DONE",
                    format!("{} complete", phase.as_str()),
                );
                self.save(job)?;
            }
            budget.tick();
        }
        Ok(())
    }

    fn handle_failure(&self, job: &mut ImportJob, err: &EngineError) {
        let phase = job.phase.as_str();
        match failure_action(err, &mut job.retries, job.max_retries) {
            FailureAction::Retry => {
                job.last_error = Some(JobError::from_engine(err, true));
                job.log.push(
                    &job.id,
                    LogLevel::Warning,
                    phase,
                    "TP-IMP-RETRY",
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

    /// Mark the job failed, rolling back first when live data was touched.
    fn fail(&self, job: &mut ImportJob, err: &EngineError) {
        job.status = JobStatus::Failed;
        job.last_error = Some(JobError::from_engine(err, false));
        job.log.error(
            &job.id,
            job.phase.as_str(),
            "TP-IMP-FAILED",
            err.to_string(),
            json!({ "code": err.code(), "class": err.class() }),
        );
        if job.critical_phase_entered {
            if let Err(rollback_err) = self.roll_back(job) {
                job.last_error = Some(JobError::from_engine(&rollback_err, false));
            }
        } else {
            remove_dir_logged(&job.staging_dir);
        }
        job.timestamps.finish();
    }

    fn finalize(&self, job: &mut ImportJob) -> EngineResult<PhaseOutcome> {
        remove_dir_logged(&job.staging_dir);
        self.clear_restore_progress(&job.id)?;
        if self.config.discard_backups_on_success {
            self.drop_backups(job)?;
        }
        job.status = JobStatus::Completed;
        job.timestamps.finish();
        job.log.info(
            &job.id,
            Phase::Finalize.as_str(),
            "TP-IMP-DONE",
            format!(
                "import complete: {} statements, {} files",
                job.checkpoints.restore.statements,
                job.file_backups.len()
            ),
        );
        Ok(PhaseOutcome::Complete)
    }

    pub fn pause(&self, id: &str) -> EngineResult<JobStatusView> {
        self.authorize()?;
        let mut job = self.load(id)?;
        if job.status != JobStatus::Running {
            return Err(EngineError::InvalidState(format!("import {id} is {}", job.status)));
        }
        job.status = JobStatus::Paused;
        job.log.info(id, job.phase.as_str(), "TP-IMP-PAUSED", "paused");
        self.save(&mut job)?;
        Ok(job.view())
    }

    pub fn resume(&self, id: &str) -> EngineResult<JobStatusView> {
        self.authorize()?;
        let mut job = self.load(id)?;
        if job.status != JobStatus::Paused {
            return Err(EngineError::InvalidState(format!("import {id} is {}", job.status)));
        }
        job.status = JobStatus::Running;
        job.log.info(id, job.phase.as_str(), "TP-IMP-RESUMED", "resumed");
        self.save(&mut job)?;
        Ok(job.view())
    }

    /// Cancel a running or paused import. Once live data has been touched
    /// the target is rolled back before the job is marked cancelled.
    pub fn cancel(&self, id: &str) -> EngineResult<JobStatusView> {
        self.authorize()?;
        let mut job = self.load(id)?;
        if job.status.is_finished() {
            return Err(EngineError::InvalidState(format!("import {id} is {}", job.status)));
        }
        if job.critical_phase_entered {
            if let Err(err) = self.roll_back(&mut job) {
                job.status = JobStatus::Failed;
                job.last_error = Some(JobError::from_engine(&err, false));
                job.timestamps.finish();
                self.save(&mut job)?;
                return Ok(job.view());
            }
        } else {
            remove_dir_logged(&job.staging_dir);
        }
        job.status = JobStatus::Cancelled;
        job.timestamps.finish();
        job.log.info(id, job.phase.as_str(), "TP-IMP-CANCELLED", "cancelled");
        self.save(&mut job)?;
        Ok(job.view())
    }

    /// Operator-triggered rollback.
    ///
    /// Re-runs a failed or partial rollback, or reverts a completed import
    /// whose backups are still present.
    pub fn rollback(&self, id: &str) -> EngineResult<JobStatusView> {
        self.authorize()?;
        let mut job = self.load(id)?;
        match job.status {
            JobStatus::Running | JobStatus::Paused => {
                return Err(EngineError::InvalidState(format!(
                    "import {id} is {}; cancel it instead",
                    job.status
                )));
            }
            JobStatus::Completed if job.backups_discarded => {
                return Err(EngineError::InvalidState(format!(
                    "backups of import {id} were discarded"
                )));
            }
            _ if !job.critical_phase_entered => {
                return Err(EngineError::InvalidState(format!(
                    "import {id} never touched live data"
                )));
            }
            _ if job.rollback.complete => {
                return Err(EngineError::InvalidState(format!(
                    "import {id} is already rolled back"
                )));
            }
            _ => {}
        }
        let reverting = job.status == JobStatus::Completed;
        match self.roll_back(&mut job) {
            Ok(()) => {
                if reverting {
                    job.status = JobStatus::Cancelled;
                    job.log.info(id, "rollback", "TP-IMP-REVERTED", "completed import reverted");
                } else {
                    job.last_error = None;
                }
            }
            Err(err) => job.last_error = Some(JobError::from_engine(&err, false)),
        }
        job.timestamps.finish();
        self.save(&mut job)?;
        Ok(job.view())
    }

    /// Drop shadow tables and file backups of a completed import.
    pub fn discard_backups(&self, id: &str) -> EngineResult<JobStatusView> {
        self.authorize()?;
        let mut job = self.load(id)?;
        if job.status != JobStatus::Completed {
            return Err(EngineError::InvalidState(format!(
                "import {id} is {}; only completed imports can discard backups",
                job.status
            )));
        }
        if !job.backups_discarded {
            self.drop_backups(&mut job)?;
            self.save(&mut job)?;
        }
        Ok(job.view())
    }

    fn drop_backups(&self, job: &mut ImportJob) -> EngineResult<()> {
        for backup in job.table_backups.values() {
            if let Some(shadow) = &backup.shadow {
                self.db.drop_table(shadow)?;
            }
        }
        remove_dir_logged(&job.backup_dir);
        job.backups_discarded = true;
        job.log.info(&job.id, "finalize", "TP-IMP-BACKUPS-DISCARDED", "backups discarded");
        Ok(())
    }

    pub fn status(&self, id: &str) -> EngineResult<JobStatusView> {
        self.authorize()?;
        Ok(self.load(id)?.view())
    }

    /// Views of every retained import, newest first.
    pub fn list(&self) -> EngineResult<Vec<JobStatusView>> {
        self.authorize()?;
        let mut views = Vec::new();
        for id in self.store.list(JobKind::Import)? {
            views.push(self.load(&id)?.view());
        }
        views.sort_by(|a, b| b.timestamps.created_at.cmp(&a.timestamps.created_at));
        Ok(views)
    }

    pub fn report(&self, id: &str) -> EngineResult<JobReport> {
        self.authorize()?;
        Ok(self.load(id)?.report())
    }

    /// Raw record, for tests and operator tooling.
    pub fn job(&self, id: &str) -> EngineResult<ImportJob> {
        self.authorize()?;
        self.load(id)
    }
}
