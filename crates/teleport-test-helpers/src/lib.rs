//! Shared test helpers for Teleport crates.
//!
//! Everything here panics on failure; it is only ever linked into tests.

#![forbid(unsafe_code)]
#![allow(clippy::missing_panics_doc, clippy::must_use_candidate)]

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use teleport_core::{Config, Database, HostEnvironment, Row};
use teleport_db::SqliteDatabase;
use teleport_package::{MANIFEST_ENTRY, Manifest};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;

/// Scratch layout used by engine tests: a source tree, a target tree, two
/// databases and a data directory, all under one temp dir.
pub struct Workspace {
    pub dir: tempfile::TempDir,
    pub source: PathBuf,
    pub target: PathBuf,
    pub data_dir: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        let data_dir = dir.path().join("data");
        for d in [&source, &target, &data_dir] {
            fs::create_dir_all(d).expect("create workspace dir");
        }
        Self {
            dir,
            source,
            target,
            data_dir,
        }
    }

    /// Configuration rooted at this workspace with generous budgets and no
    /// disk headroom.
    pub fn config(&self) -> Config {
        test_config(&self.data_dir)
    }

    pub fn source_db(&self) -> SqliteDatabase {
        SqliteDatabase::open(&self.dir.path().join("source.db")).expect("open source db")
    }

    pub fn target_db(&self) -> SqliteDatabase {
        SqliteDatabase::open(&self.dir.path().join("target.db")).expect("open target db")
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

pub fn test_config(data_dir: &Path) -> Config {
    Config {
        data_dir: data_dir.to_path_buf(),
        chunk_size: MIB as u64,
        batch_time_limit: Duration::from_secs(60),
        batch_max_items: 100,
        rows_per_window: 100,
        statements_per_batch: 500,
        max_retries: 3,
        disk_headroom_bytes: 0,
        history_limit: 50,
        export_excludes: Vec::new(),
        signing_key_path: None,
        discard_backups_on_success: false,
        environment: HostEnvironment::default(),
    }
}

/// Deterministic, non-repeating-per-KiB content of `len` bytes.
pub fn patterned_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let block = (i / KIB) as u8;
            (i as u8).wrapping_mul(31).wrapping_add(block).wrapping_add(seed)
        })
        .collect()
}

/// Write `files` (relative path, content) under `root`.
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel, content) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, content).expect("write fixture file");
    }
}

/// Every regular file under `root`, keyed by `/`-separated relative path.
pub fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e
                .path()
                .strip_prefix(root)
                .expect("entry under root")
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            (rel, fs::read(e.path()).expect("read tree file"))
        })
        .collect()
}

/// `posts` with five rows (including text that needs escaping) and an
/// empty `options` table.
pub fn seed_database(db: &SqliteDatabase) {
    db.execute(
        "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT NOT NULL, body TEXT, score REAL);
         INSERT INTO posts (id, title, body, score) VALUES
           (1, 'hello', 'first post', 1.5),
           (2, 'it''s', 'line one\nline two', NULL),
           (3, 'semi;colon', '-- not a comment', 0.0),
           (4, 'blob', X'00FF10', -2.25),
           (5, 'last', '', 42.0);
         CREATE TABLE options (name TEXT PRIMARY KEY, value TEXT) WITHOUT ROWID;",
    )
    .expect("seed database");
}

pub fn table_rows(db: &dyn Database, table: &str) -> Vec<Row> {
    db.fetch_rows(table, 0, 10_000).expect("fetch rows")
}

fn read_entries(package: &Path) -> Vec<(String, Vec<u8>)> {
    let mut archive = ZipArchive::new(File::open(package).expect("open package")).expect("read zip");
    (0..archive.len())
        .map(|i| {
            let mut entry = archive.by_index(i).expect("zip entry");
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).expect("read zip entry");
            (entry.name().to_string(), bytes)
        })
        .collect()
}

fn write_entries(package: &Path, entries: &[(String, Vec<u8>)]) {
    let mut zip = ZipWriter::new(File::create(package).expect("create package"));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, bytes) in entries {
        zip.start_file(name.as_str(), options).expect("start entry");
        zip.write_all(bytes).expect("write entry");
    }
    zip.finish().expect("finish package");
}

/// Rewrite `manifest.json` inside `package` after applying `edit`.
pub fn rewrite_manifest(package: &Path, edit: impl FnOnce(&mut Manifest)) {
    let mut entries = read_entries(package);
    let slot = entries
        .iter_mut()
        .find(|(name, _)| name == MANIFEST_ENTRY)
        .expect("manifest entry");
    let mut manifest: Manifest = serde_json::from_slice(&slot.1).expect("parse manifest");
    edit(&mut manifest);
    slot.1 = manifest.to_json_bytes().expect("serialize manifest");
    write_entries(package, &entries);
}

/// Flip one byte in the middle of entry `name`.
pub fn corrupt_entry(package: &Path, name: &str) {
    let mut entries = read_entries(package);
    let slot = entries
        .iter_mut()
        .find(|(n, _)| n == name)
        .expect("entry to corrupt");
    let mid = slot.1.len() / 2;
    slot.1[mid] ^= 0xFF;
    write_entries(package, &entries);
}

pub fn entry_names(package: &Path) -> Vec<String> {
    read_entries(package).into_iter().map(|(name, _)| name).collect()
}

pub fn read_entry(package: &Path, name: &str) -> Vec<u8> {
    read_entries(package)
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, bytes)| bytes)
        .expect("entry present")
}
