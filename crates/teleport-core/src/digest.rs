//! Algorithm-prefixed content digests (`sha256:<hex>`).

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Algorithm tag written in front of every digest.
pub const DIGEST_ALGORITHM: &str = "sha256";

static PREFIXED_DIGEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+:[a-f0-9]{32,128}$").expect("prefixed digest regex")
});

/// `sha256:<hex>` digest of `data`.
#[must_use]
pub fn sha256_digest(data: &[u8]) -> String {
    format!("{DIGEST_ALGORITHM}:{}", hex::encode(Sha256::digest(data)))
}

/// Digest of a file on disk, streamed in 64 KiB reads.
pub fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut writer = DigestWriter::new();
    io::copy(&mut file, &mut writer)?;
    Ok(writer.finish())
}

/// Digest everything a reader yields.
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
    let mut writer = DigestWriter::new();
    io::copy(&mut reader, &mut writer)?;
    let bytes = writer.bytes_written();
    Ok((writer.finish(), bytes))
}

/// Whether `value` is shaped like `algorithm:hex` with a 32..=128 digit hex part.
///
/// Case-insensitive, matching how packages from other exporters are accepted.
#[must_use]
pub fn is_prefixed_digest(value: &str) -> bool {
    PREFIXED_DIGEST_RE.is_match(&value.to_ascii_lowercase())
}

/// Hash the in-order concatenation of chunk digest strings.
///
/// Callers pass filesystem digests first, then database digests, each in
/// chunk-index order.
pub fn global_checksum<'a, I>(digests: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Sha256::new();
    for digest in digests {
        hasher.update(digest.as_bytes());
    }
    format!("{DIGEST_ALGORITHM}:{}", hex::encode(hasher.finalize()))
}

/// `io::Write` sink that hashes whatever passes through it.
#[derive(Default)]
pub struct DigestWriter {
    hasher: Sha256,
    bytes: u64,
}

impl DigestWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn finish(self) -> String {
        format!("{DIGEST_ALGORITHM}:{}", hex::encode(self.hasher.finalize()))
    }
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        self.bytes += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
