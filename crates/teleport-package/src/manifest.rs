//! Header and manifest documents.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use teleport_core::{HostEnvironment, TELEPORT_VERSION, Version, global_checksum};

pub const PACKAGE_FORMAT: &str = "teleport";
/// Version of the package layout described by this module.
pub const PACKAGE_SPEC_VERSION: &str = "1.0.0";

pub const HEADER_ENTRY: &str = "header.json";
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// First document read from a package; identifies the format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub format: String,
    pub spec_version: String,
    pub created_at: String,
    pub exporter_version: String,
}

impl Header {
    #[must_use]
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            format: PACKAGE_FORMAT.to_string(),
            spec_version: PACKAGE_SPEC_VERSION.to_string(),
            created_at: created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            exporter_version: TELEPORT_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Filesystem,
    Database,
}

impl ChunkType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Database => "database",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    /// Filesystem: relative path of the source file. Database: entry name.
    pub path: String,
    /// Byte offset of this chunk within its source file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    pub sequence: u64,
    pub size: u64,
    pub digest: String,
}

impl ChunkDescriptor {
    #[must_use]
    pub fn filesystem(sequence: u64, path: &str, offset: u64, size: u64, digest: String) -> Self {
        Self {
            id: format!("fs-{sequence:06}"),
            chunk_type: ChunkType::Filesystem,
            path: path.to_string(),
            offset: Some(offset),
            sequence,
            size,
            digest,
        }
    }

    #[must_use]
    pub fn database(sequence: u64, size: u64, digest: String) -> Self {
        let mut chunk = Self {
            id: format!("db-{sequence:06}"),
            chunk_type: ChunkType::Database,
            path: String::new(),
            offset: None,
            sequence,
            size,
            digest,
        };
        chunk.path = chunk.entry_name();
        chunk
    }

    /// Name of the zip entry holding this chunk's bytes.
    #[must_use]
    pub fn entry_name(&self) -> String {
        match self.chunk_type {
            ChunkType::Filesystem => format!("chunks/fs-{:06}.bin", self.sequence),
            ChunkType::Database => format!("sql/db-{:06}.sql", self.sequence),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compatibility {
    pub min_importer_version: String,
    /// Either `MAJOR.MINOR.PATCH` or `MAJOR.x`.
    pub max_importer_version: String,
}

impl Compatibility {
    /// Range accepted by importers of the same major version as `exporter`.
    #[must_use]
    pub fn for_exporter(exporter: &Version) -> Self {
        Self {
            min_importer_version: format!("{}.0.0", exporter.major),
            max_importer_version: format!("{}.x", exporter.major),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRequirements {
    pub runtime_version_min: String,
    pub host_version_min: String,
    pub table_prefix: String,
    pub collation: String,
}

impl From<&HostEnvironment> for EnvironmentRequirements {
    fn from(env: &HostEnvironment) -> Self {
        Self {
            runtime_version_min: env.runtime_version.clone(),
            host_version_min: env.host_version.clone(),
            table_prefix: env.table_prefix.clone(),
            collation: env.collation.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integrity {
    pub algorithm: String,
    pub global_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub file_count: u64,
    pub file_bytes: u64,
    pub row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exporter_version: Option<String>,
    pub compatibility: Compatibility,
    pub environment: EnvironmentRequirements,
    /// Tables carried by the database dump, in dump order.
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totals: Option<Totals>,
    pub chunks: Vec<ChunkDescriptor>,
    pub integrity: Integrity,
    pub signature: SignatureBlock,
}

impl Manifest {
    /// Filesystem chunks in chunk-index order.
    pub fn filesystem_chunks(&self) -> Vec<&ChunkDescriptor> {
        self.chunks_of(ChunkType::Filesystem)
    }

    /// Database chunks in chunk-index order.
    pub fn database_chunks(&self) -> Vec<&ChunkDescriptor> {
        self.chunks_of(ChunkType::Database)
    }

    fn chunks_of(&self, kind: ChunkType) -> Vec<&ChunkDescriptor> {
        let mut chunks: Vec<_> = self.chunks.iter().filter(|c| c.chunk_type == kind).collect();
        chunks.sort_by_key(|c| c.sequence);
        chunks
    }

    /// Global checksum derived from the chunk digests listed in this manifest.
    #[must_use]
    pub fn compute_global_checksum(&self) -> String {
        let fs = self.filesystem_chunks();
        let db = self.database_chunks();
        global_checksum(fs.iter().chain(db.iter()).map(|c| c.digest.as_str()))
    }

    /// Distinct file paths in first-appearance order.
    #[must_use]
    pub fn file_paths(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.filesystem_chunks()
            .into_iter()
            .filter(|c| seen.insert(c.path.as_str()))
            .map(|c| c.path.clone())
            .collect()
    }

    /// Sum of filesystem chunk sizes.
    #[must_use]
    pub fn file_bytes(&self) -> u64 {
        self.filesystem_chunks().iter().map(|c| c.size).sum()
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}

/// Accumulates chunk descriptors and metadata into a [`Manifest`].
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    environment: EnvironmentRequirements,
    created_at: DateTime<Utc>,
    chunks: Vec<ChunkDescriptor>,
    tables: Vec<String>,
    totals: Totals,
}

impl ManifestBuilder {
    #[must_use]
    pub fn new(environment: &HostEnvironment, created_at: DateTime<Utc>) -> Self {
        Self {
            environment: environment.into(),
            created_at,
            chunks: Vec::new(),
            tables: Vec::new(),
            totals: Totals::default(),
        }
    }

    #[must_use]
    pub fn chunks(mut self, chunks: impl IntoIterator<Item = ChunkDescriptor>) -> Self {
        self.chunks.extend(chunks);
        self
    }

    #[must_use]
    pub fn tables(mut self, tables: Vec<String>) -> Self {
        self.tables = tables;
        self
    }

    #[must_use]
    pub const fn totals(mut self, totals: Totals) -> Self {
        self.totals = totals;
        self
    }

    /// Orders chunks filesystem-first and seals the global checksum.
    #[must_use]
    pub fn build(mut self) -> Manifest {
        self.chunks
            .sort_by_key(|c| (c.chunk_type == ChunkType::Database, c.sequence));
        let exporter = TELEPORT_VERSION
            .parse::<Version>()
            .unwrap_or(Version::new(0, 0, 0));
        let mut manifest = Manifest {
            format_version: PACKAGE_SPEC_VERSION.to_string(),
            created_at: Some(self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            exporter_version: Some(TELEPORT_VERSION.to_string()),
            compatibility: Compatibility::for_exporter(&exporter),
            environment: self.environment,
            tables: self.tables,
            totals: Some(self.totals),
            chunks: self.chunks,
            integrity: Integrity {
                algorithm: teleport_core::digest::DIGEST_ALGORITHM.to_string(),
                global_hash: String::new(),
            },
            signature: SignatureBlock::default(),
        };
        manifest.integrity.global_hash = manifest.compute_global_checksum();
        manifest
    }
}
