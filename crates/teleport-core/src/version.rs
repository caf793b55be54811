//! Strict `MAJOR.MINOR.PATCH` versions and `MAJOR.x` upper bounds.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("invalid version {0:?}: expected MAJOR.MINOR.PATCH")]
    NotSemver(String),
    #[error("invalid version bound {0:?}: expected MAJOR.MINOR.PATCH or MAJOR.x")]
    NotBound(String),
}

static SEMVER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)$").expect("semver regex"));
static WILDCARD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.x$").expect("wildcard regex"));

/// Returns `true` for strings of the form `MAJOR.MINOR.PATCH`.
#[must_use]
pub fn is_semver(value: &str) -> bool {
    value.parse::<Version>().is_ok()
}

/// Returns `true` for strings of the form `MAJOR.x`.
#[must_use]
pub fn is_major_wildcard(value: &str) -> bool {
    WILDCARD_RE
        .captures(value)
        .is_some_and(|c| c[1].parse::<u64>().is_ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionError::NotSemver(s.to_string());
        let caps = SEMVER_RE.captures(s).ok_or_else(err)?;
        Ok(Self {
            major: caps[1].parse().map_err(|_| err())?,
            minor: caps[2].parse().map_err(|_| err())?,
            patch: caps[3].parse().map_err(|_| err())?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Upper bound of a compatibility range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionBound {
    Exact(Version),
    /// `N.x` admits every version whose major component is at most `N`.
    MajorWildcard(u64),
}

impl VersionBound {
    /// Whether `version` does not exceed this bound.
    #[must_use]
    pub fn admits(&self, version: &Version) -> bool {
        match self {
            Self::Exact(max) => version <= max,
            Self::MajorWildcard(major) => version.major <= *major,
        }
    }
}

impl FromStr for VersionBound {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(v) = s.parse::<Version>() {
            return Ok(Self::Exact(v));
        }
        WILDCARD_RE
            .captures(s)
            .and_then(|c| c[1].parse::<u64>().ok())
            .map(Self::MajorWildcard)
            .ok_or_else(|| VersionError::NotBound(s.to_string()))
    }
}

impl fmt::Display for VersionBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(v) => fmt::Display::fmt(v, f),
            Self::MajorWildcard(major) => write!(f, "{major}.x"),
        }
    }
}
