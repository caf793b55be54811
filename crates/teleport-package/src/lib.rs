//! Teleport package format.
//!
//! A package is a zip container holding `header.json`, `manifest.json` and
//! content-addressed chunks (`chunks/fs-<seq>.bin`, `sql/db-<seq>.sql`).
//! This crate owns the document types, the validator, archive reading and
//! batched assembly, and optional Ed25519 manifest signing.

#![forbid(unsafe_code)]

pub mod archive;
pub mod crypto;
pub mod manifest;
pub mod validator;

pub use archive::{
    PackageReader, append_entries, check_chunk_bytes, package_entry_names, verify_chunk,
};
pub use crypto::{SignatureCheck, generate_signing_key, sign_manifest, verify_manifest_signature};
pub use manifest::{
    ChunkDescriptor, ChunkType, Compatibility, EnvironmentRequirements, HEADER_ENTRY, Header,
    Integrity, MANIFEST_ENTRY, Manifest, ManifestBuilder, PACKAGE_FORMAT, PACKAGE_SPEC_VERSION,
    SignatureBlock, Totals,
};
pub use validator::{
    ValidationCode, ValidationError, validate_compatibility, validate_header, validate_manifest,
};

use teleport_core::ErrorClass;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("package not found: {path}")]
    PackageNotFound { path: String },
    #[error("{name} not found in package")]
    EntryMissing { name: String },
    #[error("unsafe entry name in package: {name}")]
    UnsafeEntry { name: String },
    #[error("failed to parse {name}: {message}")]
    Parse { name: String, message: String },
    #[error("zip error: {message}")]
    Zip { message: String },
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error("global checksum mismatch: expected {expected}, got {actual}")]
    GlobalChecksumMismatch { expected: String, actual: String },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("signature error: {message}")]
    Signature { message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PackageResult<T> = Result<T, PackageError>;

impl From<zip::result::ZipError> for PackageError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => Self::Io(io),
            other => Self::Zip {
                message: other.to_string(),
            },
        }
    }
}

impl PackageError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::PackageNotFound { .. }
            | Self::EntryMissing { .. }
            | Self::UnsafeEntry { .. }
            | Self::Parse { .. }
            | Self::Zip { .. } => ErrorClass::Structural,
            Self::DigestMismatch { .. }
            | Self::SizeMismatch { .. }
            | Self::GlobalChecksumMismatch { .. }
            | Self::Signature { .. } => ErrorClass::Integrity,
            Self::Invalid(v) => v.code.class(),
            Self::Io(_) => ErrorClass::TransientIo,
        }
    }

    /// Stable code reported to callers.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::PackageNotFound { .. } => "PACKAGE_NOT_FOUND",
            Self::EntryMissing { .. } | Self::Zip { .. } => "INVALID_PACKAGE",
            Self::UnsafeEntry { .. } => "UNSAFE_ENTRY",
            Self::Parse { .. } => "INVALID_MANIFEST",
            Self::DigestMismatch { .. } | Self::SizeMismatch { .. } => "CHECKSUM_MISMATCH",
            Self::GlobalChecksumMismatch { .. } => "GLOBAL_CHECKSUM_MISMATCH",
            Self::Invalid(v) => v.code.as_str(),
            Self::Signature { .. } => "SIGNATURE_INVALID",
            Self::Io(_) => "IO_ERROR",
        }
    }
}
