//! Path resolution and filesystem primitives.
//!
//! - Data: `~/.local/share/teleport/` (or `$XDG_DATA_HOME/teleport/`)
//!
//! Job records, work directories and staging trees live under the data
//! directory unless `TELEPORT_DATA_DIR` overrides it.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

static ATOMIC_WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns the data directory for teleport.
///
/// Priority order:
/// 1. `$XDG_DATA_HOME/teleport/` (if XDG_DATA_HOME is set)
/// 2. `~/.local/share/teleport/` (default)
/// 3. `%LOCALAPPDATA%/teleport/` (Windows)
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        if !xdg_data.is_empty() {
            return PathBuf::from(xdg_data).join("teleport");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(local) = dirs::data_local_dir() {
            return local.join("teleport");
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Some(home) = dirs::home_dir() {
            return home.join(".local").join("share").join("teleport");
        }
    }

    PathBuf::from(".local/share/teleport")
}

/// Write `content` to `path` via a uniquely named sibling temp file and rename.
///
/// Readers observe either the previous content or the new content, never a
/// torn write.
pub fn write_file_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let seq = ATOMIC_WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = path.with_extension(format!("tmp.{}.{seq}", std::process::id()));

    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_data()?;
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Normalize an archive or manifest path into a safe relative form.
///
/// Backslashes become `/`, `.` segments are dropped. Absolute paths, Windows
/// drive letters, `..` segments and empty paths are rejected.
pub fn normalize_relative_path(raw: &str) -> Result<String> {
    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(Error::InvalidPath(format!("absolute path: {raw}")));
    }
    let bytes = unified.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(Error::InvalidPath(format!("drive-letter path: {raw}")));
    }

    let mut parts = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(Error::InvalidPath(format!("parent traversal: {raw}"))),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(Error::InvalidPath(format!("empty path: {raw:?}")));
    }
    Ok(parts.join("/"))
}

/// `/`-separated path of `path` relative to `base`.
///
/// Fails with `InvalidPath` when `path` is not inside `base`.
pub fn relative_to(base: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(base).map_err(|_| {
        Error::InvalidPath(format!(
            "{} is outside {}",
            path.display(),
            base.display()
        ))
    })?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Ok(parts.join("/"))
}

/// Lexically resolve `.` and `..` without touching the filesystem.
#[must_use]
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Move a file or directory, creating the destination's parent.
///
/// Falls back to copy-then-remove when `rename` fails across filesystems.
pub fn move_path(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if from.is_file() => {
            tracing::debug!(
                from = %from.display(),
                to = %to.display(),
                error = %err,
                "rename failed, copying instead"
            );
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(err) => Err(err),
    }
}

/// Resolve a `/`-separated relative path under `root`.
#[must_use]
pub fn join_relative(root: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|s| !s.is_empty())
        .fold(root.to_path_buf(), |acc, s| acc.join(s))
}

/// Ancestor directories of `rel` (shallowest first) that do not yet exist
/// under `root`.
#[must_use]
pub fn missing_parent_dirs(root: &Path, rel: &str) -> Vec<String> {
    let segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
    let mut missing = Vec::new();
    for depth in 1..segments.len() {
        let dir = segments[..depth].join("/");
        if !join_relative(root, &dir).exists() {
            missing.push(dir);
        }
    }
    missing
}

/// Remove `dir` if it is an empty directory. Returns whether it was removed.
pub fn remove_dir_if_empty(dir: &Path) -> io::Result<bool> {
    if !dir.is_dir() || fs::read_dir(dir)?.next().is_some() {
        return Ok(false);
    }
    fs::remove_dir(dir)?;
    Ok(true)
}
