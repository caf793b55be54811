//! Redacted projections of job records for callers.
//!
//! Views never carry backup maps, raw checkpoints or staging paths.

use serde::{Deserialize, Serialize};
use teleport_core::{JobKind, LogEntry};

use crate::job::{JobError, JobStatus, Timestamps};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounts {
    pub chunks_done: u64,
    pub chunks_total: u64,
    pub tables_done: u64,
    pub tables_total: u64,
    pub rows: u64,
    pub bytes: u64,
    pub statements: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub phase: String,
    /// 0..=100
    pub progress: u8,
    pub counts: ProgressCounts,
    pub user_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
    pub retryable: bool,
    /// Location of the finished package (exports only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<String>,
    pub retries: u32,
    #[serde(flatten)]
    pub timestamps: Timestamps,
}

impl JobStatusView {
    /// Whether another `advance` call has work to do.
    #[must_use]
    pub fn needs_advance(&self) -> bool {
        self.status == JobStatus::Running
    }
}

/// Downloadable technical report: the view, a redacted summary of the
/// record and the full job log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: JobStatusView,
    pub summary: serde_json::Value,
    pub log: Vec<LogEntry>,
}

/// Fields shared by both kinds when building a view.
pub(crate) struct ViewParts<'a> {
    pub id: &'a str,
    pub kind: JobKind,
    pub status: JobStatus,
    pub phase: &'a str,
    pub progress: u8,
    pub counts: ProgressCounts,
    pub last_error: Option<&'a JobError>,
    pub download: Option<String>,
    pub retries: u32,
    pub timestamps: &'a Timestamps,
}

impl ViewParts<'_> {
    pub(crate) fn into_view(self) -> JobStatusView {
        let progress = if self.status == JobStatus::Completed {
            100
        } else {
            self.progress.min(99)
        };
        JobStatusView {
            id: self.id.to_string(),
            kind: self.kind,
            status: self.status,
            phase: self.phase.to_string(),
            progress,
            counts: self.counts,
            user_message: self.last_error.map_or_else(
                || default_message(self.kind, self.status).to_string(),
                |e| e.message.clone(),
            ),
            technical_detail: self.last_error.map(|e| e.detail.clone()),
            last_error_code: self.last_error.map(|e| e.code.clone()),
            retryable: self.last_error.is_some_and(|e| e.retryable),
            download: self.download,
            retries: self.retries,
            timestamps: self.timestamps.clone(),
        }
    }
}

const fn default_message(kind: JobKind, status: JobStatus) -> &'static str {
    match (kind, status) {
        (JobKind::Export, JobStatus::Running) => "Export in progress.",
        (JobKind::Import, JobStatus::Running) => "Import in progress.",
        (_, JobStatus::Paused) => "Paused.",
        (JobKind::Export, JobStatus::Completed) => "Export complete. The package is ready.",
        (JobKind::Import, JobStatus::Completed) => "Import complete.",
        (_, JobStatus::Failed) => "The job failed.",
        (_, JobStatus::Cancelled) => "Cancelled.",
    }
}

/// Linear progress inside the band `[start, end)` of the overall bar.
#[must_use]
pub(crate) fn band(start: u8, end: u8, done: u64, total: u64) -> u8 {
    if total == 0 {
        return start;
    }
    let span = u64::from(end.saturating_sub(start));
    let within = span * done.min(total) / total;
    start.saturating_add(u8::try_from(within).unwrap_or(0))
}
