//! Free-space probing for the import environment check.

use std::io;
use std::path::{Path, PathBuf};

/// Bytes per MiB.
pub const MIB: u64 = 1024 * 1024;

fn normalize_probe_path(path: &Path) -> PathBuf {
    // statvfs typically requires the path to exist; probe the closest existing parent.
    if path.exists() {
        return path.to_path_buf();
    }
    let mut cur = path;
    while let Some(parent) = cur.parent() {
        if parent.as_os_str().is_empty() {
            break;
        }
        if parent.exists() {
            return parent.to_path_buf();
        }
        cur = parent;
    }
    PathBuf::from(".")
}

/// Bytes available to unprivileged writers on the filesystem holding `path`.
pub fn disk_free_bytes(path: &Path) -> io::Result<u64> {
    fs2::available_space(normalize_probe_path(path))
}

/// Whether `free` bytes cover `needed` plus `headroom`.
#[must_use]
pub const fn has_room(free: u64, needed: u64, headroom: u64) -> bool {
    free >= needed.saturating_add(headroom)
}
