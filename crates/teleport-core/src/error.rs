//! Error types for Teleport
//!
//! `Error` covers host-capability and generic failures. `ErrorClass` is the
//! taxonomy every engine error is projected onto before it reaches a caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Teleport core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for host capabilities and shared plumbing
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Resource Not Found Errors
    // ==========================================================================
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    // ==========================================================================
    // Validation Errors
    // ==========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid job id: {0}. Must match ^[a-f0-9-]{{36}}$")]
    InvalidJobId(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // ==========================================================================
    // Authorization Errors
    // ==========================================================================
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // ==========================================================================
    // Host Capability Errors
    // ==========================================================================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Job store error: {0}")]
    Store(String),

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==========================================================================
    // Internal Errors
    // ==========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error type string (for JSON responses)
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::JobNotFound(_) | Self::TableNotFound(_) => "NOT_FOUND",
            Self::InvalidArgument(_) | Self::InvalidJobId(_) | Self::InvalidPath(_) => {
                "INVALID_ARGUMENT"
            }
            Self::PermissionDenied(_) => "PERMISSION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Io(_) => "OS_ERROR",
            Self::Serialization(_) => "TYPE_ERROR",
            Self::Internal(_) => "UNHANDLED_EXCEPTION",
        }
    }

    /// Returns whether the error is transient (a later call may succeed)
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Store(_) | Self::Io(_)
        )
    }
}

/// Error taxonomy exposed to callers of the export/import engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed header, manifest or archive layout.
    Structural,
    /// Version, prefix or collation mismatch.
    Compatibility,
    /// Checksum mismatch between manifest and archive bytes.
    Integrity,
    /// Read/write/query failure during a phase.
    TransientIo,
    /// Disk or permission shortfall on the target.
    Environment,
    /// Retry ceiling exceeded, or rollback itself failed.
    Terminal,
}

impl ErrorClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::Compatibility => "compatibility",
            Self::Integrity => "integrity",
            Self::TransientIo => "transient_io",
            Self::Environment => "environment",
            Self::Terminal => "terminal",
        }
    }

    /// Transient and environment errors count against the retry ceiling;
    /// everything else ends the job on first occurrence.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::TransientIo | Self::Environment)
    }

    /// Validation-stage classes are always raised before any live mutation.
    #[must_use]
    pub const fn is_validation(self) -> bool {
        matches!(self, Self::Structural | Self::Compatibility | Self::Integrity)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
