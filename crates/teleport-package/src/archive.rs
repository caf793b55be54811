//! Zip container access: inspection, reading and batched assembly.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use teleport_core::digest::DigestWriter;
use teleport_core::paths::normalize_relative_path;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::manifest::{ChunkDescriptor, HEADER_ENTRY, Header, MANIFEST_ENTRY, Manifest};
use crate::validator::{validate_header, validate_manifest};
use crate::{PackageError, PackageResult};

/// Read-only view of a package on disk.
///
/// Opening a package inspects every entry name and requires both the header
/// and the manifest to be present.
pub struct PackageReader {
    path: PathBuf,
    archive: ZipArchive<File>,
}

impl std::fmt::Debug for PackageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageReader")
            .field("path", &self.path)
            .field("entries", &self.archive.len())
            .finish()
    }
}

impl PackageReader {
    pub fn open(path: &Path) -> PackageResult<Self> {
        if !path.is_file() {
            return Err(PackageError::PackageNotFound {
                path: path.display().to_string(),
            });
        }
        let archive = ZipArchive::new(File::open(path)?)?;
        let reader = Self {
            path: path.to_path_buf(),
            archive,
        };
        reader.inspect()?;
        Ok(reader)
    }

    fn inspect(&self) -> PackageResult<()> {
        let mut names = HashSet::new();
        for name in self.archive.file_names() {
            if name.ends_with('/') {
                continue;
            }
            let normalized =
                normalize_relative_path(name).map_err(|_| PackageError::UnsafeEntry {
                    name: name.to_string(),
                })?;
            if normalized != name {
                return Err(PackageError::UnsafeEntry {
                    name: name.to_string(),
                });
            }
            names.insert(name);
        }
        for required in [HEADER_ENTRY, MANIFEST_ENTRY] {
            if !names.contains(required) {
                return Err(PackageError::EntryMissing {
                    name: required.to_string(),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entry names in archive order.
    #[must_use]
    pub fn entry_names(&self) -> Vec<String> {
        self.archive.file_names().map(str::to_string).collect()
    }

    pub fn read_entry(&mut self, name: &str) -> PackageResult<Vec<u8>> {
        let mut entry = self.archive.by_name(name).map_err(|e| entry_error(name, e))?;
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn read_json(&mut self, name: &str) -> PackageResult<serde_json::Value> {
        let bytes = self.read_entry(name)?;
        serde_json::from_slice(&bytes).map_err(|e| PackageError::Parse {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Read and validate `header.json`.
    pub fn read_header(&mut self) -> PackageResult<Header> {
        let value = self.read_json(HEADER_ENTRY)?;
        Ok(validate_header(&value)?)
    }

    /// Read and structurally validate `manifest.json`.
    pub fn read_manifest(&mut self) -> PackageResult<Manifest> {
        let value = self.read_json(MANIFEST_ENTRY)?;
        Ok(validate_manifest(&value)?)
    }

    /// Stream an entry into `writer`, returning its digest and length.
    pub fn copy_entry<W: Write>(&mut self, name: &str, writer: &mut W) -> PackageResult<(String, u64)> {
        let mut entry = self.archive.by_name(name).map_err(|e| entry_error(name, e))?;
        let mut digest = DigestWriter::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = entry.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digest.write_all(&buf[..n])?;
            writer.write_all(&buf[..n])?;
        }
        let len = digest.bytes_written();
        Ok((digest.finish(), len))
    }

    /// Digest and length of an entry without keeping its bytes.
    pub fn digest_entry(&mut self, name: &str) -> PackageResult<(String, u64)> {
        self.copy_entry(name, &mut io::sink())
    }
}

fn entry_error(name: &str, err: zip::result::ZipError) -> PackageError {
    match err {
        zip::result::ZipError::FileNotFound => PackageError::EntryMissing {
            name: name.to_string(),
        },
        other => other.into(),
    }
}

/// Recompute a chunk's digest from the archive and compare it to the manifest.
pub fn verify_chunk(reader: &mut PackageReader, chunk: &ChunkDescriptor) -> PackageResult<()> {
    let name = chunk.entry_name();
    let (actual, len) = reader.digest_entry(&name)?;
    check_chunk_bytes(chunk, &actual, len)
}

/// Compare a computed digest and length against a chunk descriptor.
pub fn check_chunk_bytes(chunk: &ChunkDescriptor, actual: &str, len: u64) -> PackageResult<()> {
    if !actual.eq_ignore_ascii_case(&chunk.digest) {
        return Err(PackageError::DigestMismatch {
            path: chunk.entry_name(),
            expected: chunk.digest.clone(),
            actual: actual.to_string(),
        });
    }
    if len != chunk.size {
        return Err(PackageError::SizeMismatch {
            path: chunk.entry_name(),
            expected: chunk.size,
            actual: len,
        });
    }
    Ok(())
}

/// Entry names of a complete package in the order they are written.
#[must_use]
pub fn package_entry_names(manifest: &Manifest) -> Vec<String> {
    let mut names = vec![HEADER_ENTRY.to_string(), MANIFEST_ENTRY.to_string()];
    names.extend(
        manifest
            .filesystem_chunks()
            .into_iter()
            .chain(manifest.database_chunks())
            .map(ChunkDescriptor::entry_name),
    );
    names
}

fn existing_entries(destination: &Path) -> Option<HashSet<String>> {
    let file = File::open(destination).ok()?;
    let archive = ZipArchive::new(file).ok()?;
    Some(archive.file_names().map(str::to_string).collect())
}

/// Append entries from `source_dir` to the zip at `destination`.
///
/// Entries already present in the container are skipped, so a batch that
/// crashed after sealing the central directory does not write duplicates.
/// A container left unreadable by an interrupted append is discarded and
/// rebuilt from scratch. `keep_going` is consulted after every entry; the
/// return value is `true` once every entry is in the container.
pub fn append_entries(
    destination: &Path,
    source_dir: &Path,
    entries: &[String],
    mut keep_going: impl FnMut() -> bool,
) -> PackageResult<bool> {
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(6));

    let (mut zip, present) = match existing_entries(destination) {
        Some(present) => {
            let file = OpenOptions::new().read(true).write(true).open(destination)?;
            (ZipWriter::new_append(file)?, present)
        }
        None => {
            if destination.exists() {
                tracing::warn!(
                    path = %destination.display(),
                    "[assemble] partial package unreadable, restarting from empty container"
                );
            }
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            (ZipWriter::new(File::create(destination)?), HashSet::new())
        }
    };

    let mut done = true;
    for name in entries {
        if present.contains(name) {
            continue;
        }
        if !done {
            break;
        }
        zip.start_file(name.as_str(), options)?;
        let mut source = File::open(source_dir.join(name))?;
        io::copy(&mut source, &mut zip)?;
        if !keep_going() {
            done = false;
        }
    }
    zip.finish()?;

    let complete = existing_entries(destination)
        .is_some_and(|names| entries.iter().all(|e| names.contains(e)));
    Ok(complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use teleport_core::sha256_digest;

    fn write_tree(dir: &Path, files: &[(&str, &[u8])]) -> Vec<String> {
        files
            .iter()
            .map(|(name, bytes)| {
                let path = dir.join(name);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, bytes).unwrap();
                (*name).to_string()
            })
            .collect()
    }

    #[test]
    fn append_in_batches_produces_complete_container() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let names = write_tree(
            &src,
            &[("a.json", b"{}"), ("chunks/fs-000000.bin", b"abc"), ("sql/db-000000.sql", b"x;")],
        );
        let dest = dir.path().join("out.zip");

        let mut calls = 0;
        loop {
            calls += 1;
            let done = append_entries(&dest, &src, &names, || false).unwrap();
            if done {
                break;
            }
            assert!(calls < 10);
        }
        assert_eq!(calls, 3);
        let found = existing_entries(&dest).unwrap();
        assert_eq!(found.len(), 3);
        let mut archive = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let mut buf = String::new();
        archive
            .by_name("chunks/fs-000000.bin")
            .unwrap()
            .read_to_string(&mut buf)
            .unwrap();
        assert_eq!(buf, "abc");
    }

    #[test]
    fn unreadable_partial_container_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let names = write_tree(&src, &[("one.txt", b"1"), ("two.txt", b"2")]);
        let dest = dir.path().join("out.zip");
        std::fs::write(&dest, b"PK\x03\x04 torn write").unwrap();

        assert!(append_entries(&dest, &src, &names, || true).unwrap());
        assert_eq!(existing_entries(&dest).unwrap().len(), 2);
    }

    #[test]
    fn rerun_after_completion_adds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let names = write_tree(&src, &[("one.txt", b"1")]);
        let dest = dir.path().join("out.zip");
        assert!(append_entries(&dest, &src, &names, || true).unwrap());
        assert!(append_entries(&dest, &src, &names, || true).unwrap());
        let archive = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn open_rejects_traversal_entries_and_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();

        let evil = dir.path().join("evil.zip");
        let mut zip = ZipWriter::new(File::create(&evil).unwrap());
        let opts = SimpleFileOptions::default();
        zip.start_file("header.json", opts).unwrap();
        zip.start_file("manifest.json", opts).unwrap();
        zip.start_file("../escape.txt", opts).unwrap();
        zip.finish().unwrap();
        assert!(matches!(
            PackageReader::open(&evil).unwrap_err(),
            PackageError::UnsafeEntry { .. }
        ));

        let bare = dir.path().join("bare.zip");
        let mut zip = ZipWriter::new(File::create(&bare).unwrap());
        zip.start_file("header.json", opts).unwrap();
        zip.finish().unwrap();
        assert!(matches!(
            PackageReader::open(&bare).unwrap_err(),
            PackageError::EntryMissing { .. }
        ));

        assert!(matches!(
            PackageReader::open(&dir.path().join("missing.zip")).unwrap_err(),
            PackageError::PackageNotFound { .. }
        ));
    }

    proptest! {
        #[test]
        fn prop_chunk_bytes_check_digest_and_length(
            bytes in proptest::collection::vec(any::<u8>(), 0..512),
            extra in 1u64..16,
        ) {
            let digest = sha256_digest(&bytes);
            let chunk = ChunkDescriptor::filesystem(0, "f.bin", 0, bytes.len() as u64, digest.clone());
            prop_assert!(check_chunk_bytes(&chunk, &digest, bytes.len() as u64).is_ok());
            prop_assert!(check_chunk_bytes(&chunk, &digest.to_uppercase(), bytes.len() as u64).is_ok());
            let short = matches!(
                check_chunk_bytes(&chunk, &digest, bytes.len() as u64 + extra),
                Err(PackageError::SizeMismatch { .. })
            );
            prop_assert!(short);
            let mut other = bytes.clone();
            other.push(0);
            let wrong = matches!(
                check_chunk_bytes(&chunk, &sha256_digest(&other), bytes.len() as u64),
                Err(PackageError::DigestMismatch { .. })
            );
            prop_assert!(wrong);
        }
    }
}
