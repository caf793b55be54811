//! Filesystem-backed job store: one JSON document per job.
//!
//! Layout: `<root>/<kind>/<id>.json`, each written via temp file + rename so
//! a crash mid-write leaves the previous record intact.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use teleport_core::paths::write_file_atomic;
use teleport_core::{Error, JobKind, JobStore, Result, ensure_job_id};

#[derive(Debug, Clone)]
pub struct FileJobStore {
    root: PathBuf,
}

impl FileJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: JobKind, id: &str) -> Result<PathBuf> {
        ensure_job_id(id)?;
        Ok(self.root.join(kind.as_str()).join(format!("{id}.json")))
    }
}

fn store_err(action: &str, path: &Path, err: &dyn std::fmt::Display) -> Error {
    Error::Store(format!("{action} {}: {err}", path.display()))
}

impl JobStore for FileJobStore {
    fn get(&self, kind: JobKind, id: &str) -> Result<Option<serde_json::Value>> {
        let path = self.record_path(kind, id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_err("read", &path, &e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| store_err("parse", &path, &e))
    }

    fn put(&self, kind: JobKind, id: &str, record: &serde_json::Value) -> Result<()> {
        let path = self.record_path(kind, id)?;
        let bytes = serde_json::to_vec_pretty(record)?;
        write_file_atomic(&path, &bytes).map_err(|e| store_err("write", &path, &e))
    }

    fn delete(&self, kind: JobKind, id: &str) -> Result<()> {
        let path = self.record_path(kind, id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_err("delete", &path, &e)),
        }
    }

    fn list(&self, kind: JobKind) -> Result<Vec<String>> {
        let dir = self.root.join(kind.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_err("list", &dir, &e)),
        };
        let mut ids: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").map(str::to_string)
            })
            .filter(|id| teleport_core::is_valid_job_id(id))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

const FINISHED: [&str; 3] = ["completed", "failed", "cancelled"];

/// Delete the oldest finished records of `kind` beyond `keep`.
///
/// Running and paused jobs are never pruned, nor are records for which
/// `pinned` returns true; neither counts towards `keep`. Returns the pruned
/// ids.
pub fn prune_history<S, P>(store: &S, kind: JobKind, keep: usize, pinned: P) -> Result<Vec<String>>
where
    S: JobStore + ?Sized,
    P: Fn(&serde_json::Value) -> bool,
{
    let mut finished = Vec::new();
    for id in store.list(kind)? {
        let Some(record) = store.get(kind, &id)? else {
            continue;
        };
        let status = record.get("status").and_then(|v| v.as_str()).unwrap_or("");
        if FINISHED.contains(&status) && !pinned(&record) {
            let created = record
                .get("created_at")
                .and_then(|v| v.as_str())
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc));
            finished.push((created, id));
        }
    }
    if finished.len() <= keep {
        return Ok(Vec::new());
    }
    // Newest first; records without a timestamp sort oldest.
    finished.sort_by(|a, b| b.cmp(a));
    let mut pruned = Vec::new();
    for (_, id) in finished.into_iter().skip(keep) {
        store.delete(kind, &id)?;
        tracing::debug!(kind = %kind, job_id = %id, "pruned job record");
        pruned.push(id);
    }
    Ok(pruned)
}
