//! Bounded structured log carried inside every job record.
//!
//! Entries carry a stable support code (`TP-EXP-*` / `TP-IMP-*`) so a
//! downloaded report can be matched against known failure modes. Every
//! entry is also emitted as a `tracing` event.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Oldest entries are dropped once a job log exceeds this many entries.
pub const MAX_LOG_ENTRIES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub phase: String,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobLog {
    entries: VecDeque<LogEntry>,
}

impl JobLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        job_id: &str,
        level: LogLevel,
        phase: &str,
        code: &str,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(job_id, phase, code, "{message}"),
            LogLevel::Info => tracing::info!(job_id, phase, code, "{message}"),
            LogLevel::Warning => tracing::warn!(job_id, phase, code, "{message}"),
            LogLevel::Error => tracing::error!(job_id, phase, code, "{message}"),
        }
        self.entries.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            phase: phase.to_string(),
            code: code.to_string(),
            message,
            context,
        });
        while self.entries.len() > MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
    }

    pub fn info(&mut self, job_id: &str, phase: &str, code: &str, message: impl Into<String>) {
        self.push(job_id, LogLevel::Info, phase, code, message, serde_json::Value::Null);
    }

    pub fn error(
        &mut self,
        job_id: &str,
        phase: &str,
        code: &str,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        self.push(job_id, LogLevel::Error, phase, code, message, context);
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }
}
