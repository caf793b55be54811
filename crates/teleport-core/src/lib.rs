//! Core types and shared plumbing for Teleport
//!
//! This crate provides:
//! - Configuration loaded from `TELEPORT_*` environment variables
//! - Error types and the error-class taxonomy
//! - Content digests and version parsing
//! - Host capability traits (`Database`, `JobStore`, `AccessGate`)
//! - Filesystem helpers, job ids and the bounded job log

#![forbid(unsafe_code)]

pub mod config;
pub mod digest;
pub mod disk;
pub mod error;
pub mod host;
pub mod ids;
pub mod joblog;
pub mod paths;
pub mod version;

/// Version of this build, used as both exporter and importer version.
pub const TELEPORT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::Config;
pub use digest::{DigestWriter, global_checksum, is_prefixed_digest, sha256_digest};
pub use error::{Error, ErrorClass, Result};
pub use host::{
    AccessGate, AllowAll, Database, HostEnvironment, JobKind, JobStore, Row, SqlValue,
    load_record, save_record,
};
pub use ids::{ensure_job_id, is_valid_job_id, new_job_id};
pub use joblog::{JobLog, LogEntry, LogLevel};
pub use version::{Version, VersionBound};
