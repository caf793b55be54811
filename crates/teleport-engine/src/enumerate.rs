//! Content enumerator: a one-shot, line-delimited index of the export tree.
//!
//! The index is written once per export to `index.jsonl` inside the work
//! directory. Later batches only read it, addressing entries by byte
//! position so the file cursor survives restarts.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use teleport_core::paths::{lexical_normalize, relative_to};
use walkdir::WalkDir;

use crate::error::{EngineError, EngineResult};

pub const INDEX_FILE: &str = "index.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// `/`-separated path relative to the export base.
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub files: u64,
    pub bytes: u64,
}

/// Inputs of a single enumeration.
#[derive(Debug, Clone)]
pub struct Enumerator<'a> {
    pub base: &'a Path,
    pub roots: &'a [PathBuf],
    /// Directories never descended into (the engine's own data).
    pub skip_dirs: &'a [PathBuf],
    pub excludes: &'a [String],
}

fn enum_err(context: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::Enumeration(format!("{context}: {err}"))
}

fn build_globset(patterns: &[String]) -> EngineResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| enum_err("exclude pattern", e))?;
        builder.add(glob);
    }
    builder.build().map_err(|e| enum_err("exclude patterns", e))
}

impl Enumerator<'_> {
    /// Resolve a root against the base, rejecting roots outside it.
    fn resolve_root(&self, base: &Path, root: &Path) -> EngineResult<PathBuf> {
        let joined = if root.is_absolute() {
            root.to_path_buf()
        } else {
            base.join(root)
        };
        let resolved = lexical_normalize(&joined);
        if !resolved.starts_with(base) {
            return Err(EngineError::Enumeration(format!(
                "root {} is outside base {}",
                root.display(),
                base.display()
            )));
        }
        Ok(resolved)
    }

    /// Walk every root and return sorted, de-duplicated entries.
    pub fn collect(&self) -> EngineResult<Vec<IndexEntry>> {
        let base = lexical_normalize(self.base);
        if !base.is_dir() {
            return Err(EngineError::Enumeration(format!(
                "base {} is not a directory",
                base.display()
            )));
        }
        let excludes = build_globset(self.excludes)?;
        let skip: Vec<PathBuf> = self.skip_dirs.iter().map(|p| lexical_normalize(p)).collect();
        let default_root = [PathBuf::from(".")];
        let roots = if self.roots.is_empty() {
            &default_root[..]
        } else {
            self.roots
        };

        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();
        for root in roots {
            let root = self.resolve_root(&base, root)?;
            let walker = WalkDir::new(&root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !skip.iter().any(|s| e.path().starts_with(s)));
            for entry in walker {
                let entry = entry.map_err(|e| enum_err("walk", e))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = relative_to(&base, entry.path())?;
                if excludes.is_match(&rel) || !seen.insert(rel.clone()) {
                    continue;
                }
                let size = entry.metadata().map_err(|e| enum_err("stat", e))?.len();
                entries.push(IndexEntry { path: rel, size });
            }
        }
        Ok(entries)
    }

    /// Write the index at `index_path` unless it already exists.
    pub fn write_index(&self, index_path: &Path) -> EngineResult<IndexSummary> {
        if index_path.is_file() {
            tracing::debug!(path = %index_path.display(), "[enumerate] index exists, reusing");
            return summarize_index(index_path);
        }
        let entries = self.collect()?;
        if let Some(parent) = index_path.parent() {
            fs::create_dir_all(parent).map_err(|e| enum_err("create work dir", e))?;
        }
        let tmp = index_path.with_extension("jsonl.tmp");
        let mut summary = IndexSummary::default();
        let write = || -> std::io::Result<()> {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for entry in &entries {
                serde_json::to_writer(&mut out, entry)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_data()?;
            fs::rename(&tmp, index_path)
        };
        write().map_err(|e| enum_err("write index", e))?;
        for entry in &entries {
            summary.files += 1;
            summary.bytes += entry.size;
        }
        tracing::info!(
            files = summary.files,
            bytes = summary.bytes,
            "[enumerate] index written"
        );
        Ok(summary)
    }
}

fn summarize_index(index_path: &Path) -> EngineResult<IndexSummary> {
    let file = File::open(index_path).map_err(|e| enum_err("open index", e))?;
    let mut summary = IndexSummary::default();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| enum_err("read index", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: IndexEntry =
            serde_json::from_str(&line).map_err(|e| enum_err("parse index", e))?;
        summary.files += 1;
        summary.bytes += entry.size;
    }
    Ok(summary)
}

/// Read the entry starting at byte `pos`, returning it with the position of
/// the next entry. `None` at end of index.
pub fn read_index_entry_at(index_path: &Path, pos: u64) -> EngineResult<Option<(IndexEntry, u64)>> {
    let mut file = File::open(index_path)?;
    file.seek(SeekFrom::Start(pos))?;
    let mut reader = BufReader::new(file);
    let mut next = pos;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            return Ok(None);
        }
        next += read as u64;
        if !line.trim().is_empty() {
            break;
        }
    }
    let entry = serde_json::from_str(line.trim_end())
        .map_err(|e| enum_err(&format!("index entry at byte {pos}"), e))?;
    Ok(Some((entry, next)))
}
