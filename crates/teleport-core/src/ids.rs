//! Job identifiers: random UUID-v4-shaped lowercase strings.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static JOB_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9\-]{36}$").expect("job id regex"));

/// Generate a fresh job id (`xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx`).
pub fn new_job_id() -> Result<String> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| Error::Internal(format!("random source unavailable: {e}")))?;
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let h = hex::encode(bytes);
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    ))
}

#[must_use]
pub fn is_valid_job_id(id: &str) -> bool {
    JOB_ID_RE.is_match(id)
}

/// Reject ids that could escape the job store's directory layout.
pub fn ensure_job_id(id: &str) -> Result<()> {
    if is_valid_job_id(id) {
        Ok(())
    } else {
        Err(Error::InvalidJobId(id.to_string()))
    }
}
