//! Configuration for Teleport
//!
//! Every knob is read from a `TELEPORT_*` environment variable. Resource
//! limits are clamped into safe ranges rather than rejected, so a bad value
//! degrades to a working configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::disk::MIB;
use crate::host::HostEnvironment;

pub const DEFAULT_CHUNK_SIZE: u64 = MIB;
pub const MIN_CHUNK_SIZE: u64 = 1024;

pub const DEFAULT_BATCH_TIME_SECS: u64 = 8;
pub const MIN_BATCH_TIME_SECS: u64 = 1;
pub const MAX_BATCH_TIME_SECS: u64 = 120;

pub const DEFAULT_BATCH_MAX_ITEMS: usize = 100;
pub const MIN_BATCH_MAX_ITEMS: usize = 10;
pub const MAX_BATCH_MAX_ITEMS: usize = 1000;

pub const DEFAULT_ROWS_PER_WINDOW: usize = 100;
pub const DEFAULT_STATEMENTS_PER_BATCH: usize = 500;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_DISK_HEADROOM_MB: u64 = 64;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for job records, export work dirs, import staging and backups.
    pub data_dir: PathBuf,
    /// Size ceiling of a single chunk in bytes.
    pub chunk_size: u64,
    /// Wall-clock ceiling of one `continue` call.
    pub batch_time_limit: Duration,
    /// Item ceiling of one `continue` call.
    pub batch_max_items: usize,
    pub rows_per_window: usize,
    pub statements_per_batch: usize,
    pub max_retries: u32,
    pub disk_headroom_bytes: u64,
    /// Finished jobs retained per kind.
    pub history_limit: usize,
    /// Glob patterns (relative to the export base) skipped by the enumerator.
    pub export_excludes: Vec<String>,
    /// Ed25519 secret key file used to sign exported manifests.
    pub signing_key_path: Option<PathBuf>,
    /// Drop shadow tables and file backups as soon as an import finalizes.
    pub discard_backups_on_success: bool,
    pub environment: HostEnvironment,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: crate::paths::data_dir(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_time_limit: Duration::from_secs(DEFAULT_BATCH_TIME_SECS),
            batch_max_items: DEFAULT_BATCH_MAX_ITEMS,
            rows_per_window: DEFAULT_ROWS_PER_WINDOW,
            statements_per_batch: DEFAULT_STATEMENTS_PER_BATCH,
            max_retries: DEFAULT_MAX_RETRIES,
            disk_headroom_bytes: DEFAULT_DISK_HEADROOM_MB * MIB,
            history_limit: DEFAULT_HISTORY_LIMIT,
            export_excludes: Vec::new(),
            signing_key_path: None,
            discard_backups_on_success: false,
            environment: HostEnvironment::default(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(env_value)
    }

    /// Load configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env_defaults = defaults.environment.clone();

        let data_dir = lookup("TELEPORT_DATA_DIR")
            .filter(|v| !v.trim().is_empty())
            .map_or(defaults.data_dir, PathBuf::from);

        let batch_secs = env_u64(&lookup, "TELEPORT_BATCH_TIME_SECS", DEFAULT_BATCH_TIME_SECS)
            .clamp(MIN_BATCH_TIME_SECS, MAX_BATCH_TIME_SECS);

        Self {
            data_dir,
            chunk_size: env_u64(&lookup, "TELEPORT_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)
                .max(MIN_CHUNK_SIZE),
            batch_time_limit: Duration::from_secs(batch_secs),
            batch_max_items: env_usize(&lookup, "TELEPORT_BATCH_MAX_ITEMS", DEFAULT_BATCH_MAX_ITEMS)
                .clamp(MIN_BATCH_MAX_ITEMS, MAX_BATCH_MAX_ITEMS),
            rows_per_window: env_usize(&lookup, "TELEPORT_ROWS_PER_WINDOW", DEFAULT_ROWS_PER_WINDOW)
                .max(1),
            statements_per_batch: env_usize(
                &lookup,
                "TELEPORT_STATEMENTS_PER_BATCH",
                DEFAULT_STATEMENTS_PER_BATCH,
            )
            .max(1),
            max_retries: env_u32(&lookup, "TELEPORT_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            disk_headroom_bytes: env_u64(
                &lookup,
                "TELEPORT_DISK_HEADROOM_MB",
                DEFAULT_DISK_HEADROOM_MB,
            )
            .saturating_mul(MIB),
            history_limit: env_usize(&lookup, "TELEPORT_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT)
                .max(1),
            export_excludes: lookup("TELEPORT_EXPORT_EXCLUDE")
                .map(|v| parse_csv(&v))
                .unwrap_or_default(),
            signing_key_path: lookup("TELEPORT_SIGNING_KEY")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            discard_backups_on_success: env_bool(&lookup, "TELEPORT_DISCARD_BACKUPS", false),
            environment: HostEnvironment {
                runtime_version: lookup("TELEPORT_RUNTIME_VERSION")
                    .unwrap_or(env_defaults.runtime_version),
                host_version: lookup("TELEPORT_HOST_VERSION").unwrap_or(env_defaults.host_version),
                table_prefix: lookup("TELEPORT_TABLE_PREFIX").unwrap_or(env_defaults.table_prefix),
                collation: lookup("TELEPORT_COLLATION").unwrap_or(env_defaults.collation),
            },
        }
    }

    /// Directory holding persisted job records.
    #[must_use]
    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    /// Scratch directory of one export.
    #[must_use]
    pub fn export_work_dir(&self, export_id: &str) -> PathBuf {
        self.data_dir.join("work").join(export_id)
    }

    /// Directory finished packages are written to.
    #[must_use]
    pub fn packages_dir(&self) -> PathBuf {
        self.data_dir.join("packages")
    }

    #[must_use]
    pub fn staging_dir(&self, job_id: &str) -> PathBuf {
        self.data_dir.join("staging").join(job_id)
    }

    #[must_use]
    pub fn backup_dir(&self, job_id: &str) -> PathBuf {
        self.data_dir.join("backups").join(job_id)
    }
}

/// Read a variable from the process environment.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    env::var(key).ok()
}

#[must_use]
pub fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        _ => default,
    }
}

pub fn env_bool<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: bool) -> bool {
    lookup(key).map_or(default, |v| parse_bool(&v, default))
}

fn env_u32<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u32) -> u32 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u64) -> u64 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[must_use]
pub fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
