//! Types shared by export and import job records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use teleport_core::ErrorClass;

use crate::error::EngineError;

/// Terminal or in-flight outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last error recorded on a job, split into a user message and a
/// technical detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub class: ErrorClass,
    pub message: String,
    pub detail: String,
    pub retryable: bool,
}

impl JobError {
    #[must_use]
    pub fn from_engine(err: &EngineError, retryable: bool) -> Self {
        Self {
            code: err.code().to_string(),
            class: err.class(),
            message: err.user_message(),
            detail: err.to_string(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl Timestamps {
    #[must_use]
    pub fn now() -> Self {
        Self {
            created_at: Utc::now(),
            updated_at: None,
            ended_at: None,
            duration_ms: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    /// Stamp the end of the job and derive its wall-clock duration.
    pub fn finish(&mut self) {
        let now = Utc::now();
        self.updated_at = Some(now);
        self.ended_at = Some(now);
        let millis = (now - self.created_at).num_milliseconds().max(0);
        self.duration_ms = u64::try_from(millis).ok();
    }
}

/// What the caller should do after a failed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureAction {
    /// Within the ceiling; the next `advance` retries the step.
    Retry,
    /// Validation-class or terminal error; no retry.
    Fail,
    /// Retryable error that exceeded the ceiling.
    Exhausted,
}

/// Apply the retry policy to `err`, bumping `retries` when it counts.
pub(crate) fn failure_action(err: &EngineError, retries: &mut u32, max_retries: u32) -> FailureAction {
    if !err.class().is_retryable() {
        return FailureAction::Fail;
    }
    *retries += 1;
    if *retries > max_retries {
        FailureAction::Exhausted
    } else {
        FailureAction::Retry
    }
}
