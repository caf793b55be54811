//! Filesystem chunk writer.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use teleport_core::paths::{join_relative, write_file_atomic};
use teleport_core::sha256_digest;
use teleport_package::ChunkDescriptor;

use crate::enumerate::IndexEntry;
use crate::error::EngineResult;

/// Result of cutting one chunk from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub chunk: ChunkDescriptor,
    /// Offset to resume from when the file is not finished.
    pub next_offset: u64,
    pub file_done: bool,
}

/// Cut the chunk of `entry` starting at `offset` into `work_dir`.
///
/// Reads at most `chunk_size` bytes and never past the enumerated size, so a
/// file that grows after enumeration is captured as it was indexed. A file
/// that shrank finishes at its new end. Zero-byte files yield one empty
/// chunk. Returns `None` when the file disappeared since enumeration.
pub fn write_file_chunk(
    base: &Path,
    work_dir: &Path,
    entry: &IndexEntry,
    offset: u64,
    sequence: u64,
    chunk_size: u64,
) -> EngineResult<Option<FileChunk>> {
    let source = join_relative(base, &entry.path);
    let mut file = match File::open(&source) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let wanted = chunk_size.min(entry.size.saturating_sub(offset));
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(usize::try_from(wanted).unwrap_or(0));
    file.take(wanted).read_to_end(&mut buf)?;
    let len = buf.len() as u64;

    let chunk = ChunkDescriptor::filesystem(sequence, &entry.path, offset, len, sha256_digest(&buf));
    write_file_atomic(&work_dir.join(chunk.entry_name()), &buf)?;

    let next_offset = offset + len;
    Ok(Some(FileChunk {
        chunk,
        next_offset,
        file_done: len < wanted || next_offset >= entry.size,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64) -> IndexEntry {
        IndexEntry {
            path: path.to_string(),
            size,
        }
    }

    #[test]
    fn splits_at_chunk_size_and_finishes_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(dir.path().join("f.bin"), &data).unwrap();
        let work = dir.path().join("work");

        let first = write_file_chunk(dir.path(), &work, &entry("f.bin", 2048), 0, 0, 1024)
            .unwrap()
            .unwrap();
        assert!(!first.file_done);
        assert_eq!(first.next_offset, 1024);
        let second = write_file_chunk(dir.path(), &work, &entry("f.bin", 2048), 1024, 1, 1024)
            .unwrap()
            .unwrap();
        // An exact multiple finishes on the last full chunk.
        assert!(second.file_done);
        assert_eq!(second.chunk.offset, Some(1024));
        let stored = std::fs::read(work.join(second.chunk.entry_name())).unwrap();
        assert_eq!(stored, &data[1024..]);
    }

    #[test]
    fn empty_file_yields_one_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("e"), b"").unwrap();
        let out = write_file_chunk(dir.path(), &dir.path().join("w"), &entry("e", 0), 0, 3, 1024)
            .unwrap()
            .unwrap();
        assert!(out.file_done);
        assert_eq!(out.chunk.size, 0);
        assert_eq!(out.chunk.id, "fs-000003");
        assert_eq!(out.chunk.digest, sha256_digest(b""));
    }

    #[test]
    fn shrunk_and_vanished_files_do_not_stall() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("s"), b"abc").unwrap();
        let out = write_file_chunk(dir.path(), &dir.path().join("w"), &entry("s", 5000), 0, 0, 1024)
            .unwrap()
            .unwrap();
        assert!(out.file_done);
        assert_eq!(out.chunk.size, 3);

        assert!(
            write_file_chunk(dir.path(), &dir.path().join("w"), &entry("gone", 1), 0, 1, 1024)
                .unwrap()
                .is_none()
        );
    }
}
