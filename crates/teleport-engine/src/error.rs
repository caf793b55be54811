//! Engine error type and its projection onto [`ErrorClass`].

use teleport_core::ErrorClass;
use teleport_package::PackageError;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    // ==========================================================================
    // Caller Errors
    // ==========================================================================
    #[error("access denied")]
    AccessDenied,

    #[error("invalid state: {0}")]
    InvalidState(String),

    // ==========================================================================
    // Wrapped Errors
    // ==========================================================================
    #[error(transparent)]
    Core(#[from] teleport_core::Error),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ==========================================================================
    // Environment Errors
    // ==========================================================================
    /// Target does not satisfy the package's environment block.
    #[error("{message}")]
    EnvironmentMismatch { code: &'static str, message: String },

    /// Disk or permission shortfall that may clear up on retry.
    #[error("{message}")]
    EnvironmentUnavailable { code: &'static str, message: String },

    // ==========================================================================
    // Terminal Errors
    // ==========================================================================
    #[error("enumeration failed: {0}")]
    Enumeration(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("rollback failed: {0}")]
    RollbackFailed(String),
}

impl EngineError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::AccessDenied
            | Self::InvalidState(_)
            | Self::Enumeration(_)
            | Self::RetriesExhausted { .. }
            | Self::RollbackFailed(_) => ErrorClass::Terminal,
            Self::Core(err) => match err {
                teleport_core::Error::Database(_)
                | teleport_core::Error::Store(_)
                | teleport_core::Error::Io(_)
                | teleport_core::Error::TableNotFound(_) => ErrorClass::TransientIo,
                teleport_core::Error::PermissionDenied(_) => ErrorClass::Environment,
                teleport_core::Error::InvalidPath(_) => ErrorClass::Structural,
                teleport_core::Error::JobNotFound(_)
                | teleport_core::Error::InvalidArgument(_)
                | teleport_core::Error::InvalidJobId(_)
                | teleport_core::Error::Serialization(_)
                | teleport_core::Error::Internal(_) => ErrorClass::Terminal,
            },
            Self::Package(err) => err.class(),
            Self::Io(_) => ErrorClass::TransientIo,
            Self::EnvironmentMismatch { .. } => ErrorClass::Compatibility,
            Self::EnvironmentUnavailable { .. } => ErrorClass::Environment,
        }
    }

    /// Stable code reported to callers.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AccessDenied => "ACCESS_DENIED",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Core(err) => err.error_type(),
            Self::Package(err) => err.code(),
            Self::Io(_) => "IO_ERROR",
            Self::EnvironmentMismatch { code, .. } | Self::EnvironmentUnavailable { code, .. } => {
                *code
            }
            Self::Enumeration(_) => "ENUMERATION_FAILED",
            Self::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Self::RollbackFailed(_) => "ROLLBACK_FAILED",
        }
    }

    /// Short message suitable for an end user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self.class() {
            ErrorClass::Structural => "The package is damaged or not a Teleport package.".into(),
            ErrorClass::Compatibility => {
                "The package is not compatible with this installation.".into()
            }
            ErrorClass::Integrity => "The package failed its integrity check.".into(),
            ErrorClass::TransientIo => "A temporary read or write error occurred.".into(),
            ErrorClass::Environment => {
                "The server does not have enough disk space or permissions.".into()
            }
            ErrorClass::Terminal => match self {
                Self::RollbackFailed(_) => {
                    "Restoring the previous state failed. Manual attention is required.".into()
                }
                _ => "The job could not be completed.".into(),
            },
        }
    }
}
