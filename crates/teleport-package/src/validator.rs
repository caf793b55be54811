//! Structural and compatibility validation of package documents.
//!
//! Structural checks run against the raw JSON so that a missing or mistyped
//! field is reported by name instead of surfacing as a serde error.

use std::collections::HashSet;
use std::fmt;

use serde_json::{Map, Value};
use teleport_core::paths::normalize_relative_path;
use teleport_core::version::{is_major_wildcard, is_semver};
use teleport_core::{ErrorClass, Version, VersionBound, is_prefixed_digest};

use crate::manifest::{Header, Manifest, PACKAGE_FORMAT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationCode {
    InvalidHeader,
    InvalidManifest,
    InvalidChunk,
    ImporterTooOld,
    ImporterTooNew,
}

impl ValidationCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidHeader => "INVALID_HEADER",
            Self::InvalidManifest => "INVALID_MANIFEST",
            Self::InvalidChunk => "INVALID_CHUNK",
            Self::ImporterTooOld => "IMPORTER_TOO_OLD",
            Self::ImporterTooNew => "IMPORTER_TOO_NEW",
        }
    }

    /// Coarse family a caller can match on without knowing every code.
    #[must_use]
    pub const fn family(self) -> &'static str {
        match self {
            Self::ImporterTooOld | Self::ImporterTooNew => "UNSUPPORTED_IMPORTER_VERSION",
            other => other.as_str(),
        }
    }

    #[must_use]
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::ImporterTooOld | Self::ImporterTooNew => ErrorClass::Compatibility,
            Self::InvalidHeader | Self::InvalidManifest | Self::InvalidChunk => {
                ErrorClass::Structural
            }
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ValidationError {
    pub code: ValidationCode,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

type Checked<T> = Result<T, ValidationError>;

const HEADER: ValidationCode = ValidationCode::InvalidHeader;
const MANIFEST: ValidationCode = ValidationCode::InvalidManifest;

fn header_err(msg: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationCode::InvalidHeader, msg)
}

fn manifest_err(msg: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationCode::InvalidManifest, msg)
}

fn chunk_err(index: usize, msg: impl fmt::Display) -> ValidationError {
    ValidationError::new(ValidationCode::InvalidChunk, format!("chunk #{index}: {msg}"))
}

fn object<'a>(value: &'a Value, what: &str, code: ValidationCode) -> Checked<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| ValidationError::new(code, format!("{what} must be an object")))
}

fn string_field<'a>(obj: &'a Map<String, Value>, key: &str, code: ValidationCode) -> Checked<&'a str> {
    match obj.get(key) {
        None => Err(ValidationError::new(
            code,
            format!("missing required field `{key}`"),
        )),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(ValidationError::new(
            code,
            format!("field `{key}` must be a string"),
        )),
    }
}

fn semver_field(obj: &Map<String, Value>, key: &str, code: ValidationCode) -> Checked<()> {
    let value = string_field(obj, key, code)?;
    if is_semver(value) {
        Ok(())
    } else {
        Err(ValidationError::new(
            code,
            format!("`{key}` must be MAJOR.MINOR.PATCH, got {value:?}"),
        ))
    }
}

fn required<'a>(obj: &'a Map<String, Value>, key: &str) -> Checked<&'a Value> {
    obj.get(key)
        .ok_or_else(|| manifest_err(format!("missing required field `{key}`")))
}

/// Validate `header.json` and decode it.
pub fn validate_header(value: &Value) -> Checked<Header> {
    let obj = object(value, "header", HEADER)?;
    let format = string_field(obj, "format", HEADER)?;
    if format != PACKAGE_FORMAT {
        return Err(header_err(format!(
            "unsupported package format {format:?}, expected {PACKAGE_FORMAT:?}"
        )));
    }
    semver_field(obj, "spec_version", HEADER)?;
    semver_field(obj, "exporter_version", HEADER)?;
    if string_field(obj, "created_at", HEADER)?.trim().is_empty() {
        return Err(header_err("`created_at` must not be empty"));
    }
    serde_json::from_value(value.clone()).map_err(|e| header_err(e.to_string()))
}

/// Validate `manifest.json` structurally and decode it.
pub fn validate_manifest(value: &Value) -> Checked<Manifest> {
    let obj = object(value, "manifest", MANIFEST)?;

    semver_field(obj, "format_version", MANIFEST)?;

    let compat = object(required(obj, "compatibility")?, "compatibility", MANIFEST)?;
    semver_field(compat, "min_importer_version", MANIFEST)?;
    let max = string_field(compat, "max_importer_version", MANIFEST)?;
    if !is_semver(max) && !is_major_wildcard(max) {
        return Err(manifest_err(format!(
            "`max_importer_version` must be MAJOR.MINOR.PATCH or MAJOR.x, got {max:?}"
        )));
    }

    let env = object(required(obj, "environment")?, "environment", MANIFEST)?;
    semver_field(env, "runtime_version_min", MANIFEST)?;
    semver_field(env, "host_version_min", MANIFEST)?;
    string_field(env, "table_prefix", MANIFEST)?;
    string_field(env, "collation", MANIFEST)?;

    let chunks = match obj.get("chunks") {
        Some(Value::Array(items)) => items,
        Some(_) => return Err(manifest_err("`chunks` must be an array")),
        None => return Err(manifest_err("missing required field `chunks`")),
    };
    if chunks.is_empty() {
        return Err(manifest_err("package contains no chunks"));
    }
    let mut ids = HashSet::new();
    let mut derived = Vec::new();
    for (index, chunk) in chunks.iter().enumerate() {
        let (id, sequence) = validate_chunk(index, chunk)?;
        if !ids.insert(id) {
            return Err(chunk_err(index, format!("duplicate id {id:?}")));
        }
        if let Some(sequence) = sequence {
            derived.push((index, sequence));
        }
    }

    let integrity = object(required(obj, "integrity")?, "integrity", MANIFEST)?;
    string_field(integrity, "algorithm", MANIFEST)?;
    let global = string_field(integrity, "global_hash", MANIFEST)?;
    if !is_prefixed_digest(global) {
        return Err(manifest_err("`integrity.global_hash` is not a valid digest"));
    }

    let signature = object(required(obj, "signature")?, "signature", MANIFEST)?;
    match signature.get("enabled") {
        Some(Value::Bool(true)) => {
            let sig = signature
                .get("manifest_signature")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if sig.trim().is_empty() {
                return Err(manifest_err(
                    "signature is enabled but `manifest_signature` is empty",
                ));
            }
        }
        Some(Value::Bool(false)) => {}
        Some(_) => return Err(manifest_err("`signature.enabled` must be a boolean")),
        None => return Err(manifest_err("missing required field `signature.enabled`")),
    }

    if let Some(tables) = obj.get("tables") {
        let ok = tables
            .as_array()
            .is_some_and(|t| t.iter().all(Value::is_string));
        if !ok {
            return Err(manifest_err("`tables` must be an array of strings"));
        }
    }

    let mut value = value.clone();
    for (index, sequence) in derived {
        if let Some(chunk) = value
            .pointer_mut(&format!("/chunks/{index}"))
            .and_then(Value::as_object_mut)
        {
            chunk.insert("sequence".to_string(), Value::from(sequence));
        }
    }
    serde_json::from_value(value).map_err(|e| manifest_err(e.to_string()))
}

/// Sequence number carried by an id such as `fs-000007`.
fn sequence_from_id(id: &str) -> Option<u64> {
    let (_, digits) = id.rsplit_once('-')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Checks one chunk entry. Returns its id and, when the entry has no
/// `sequence`, the one derived from the id.
fn validate_chunk(index: usize, chunk: &Value) -> Checked<(&str, Option<u64>)> {
    let obj = chunk
        .as_object()
        .ok_or_else(|| chunk_err(index, "must be an object"))?;
    let id = non_empty(obj, index, "id")?;
    let kind = non_empty(obj, index, "type")?;
    if kind != "filesystem" && kind != "database" {
        return Err(chunk_err(index, format!("unknown type {kind:?}")));
    }
    let path = non_empty(obj, index, "path")?;
    normalize_relative_path(path).map_err(|e| chunk_err(index, e))?;
    match obj.get("size") {
        Some(v) if v.as_u64().is_some() => {}
        Some(_) => return Err(chunk_err(index, "`size` must be a non-negative integer")),
        None => return Err(chunk_err(index, "`size` is required")),
    }
    let derived = match obj.get("sequence") {
        Some(v) if v.as_u64().is_some() => None,
        Some(_) => return Err(chunk_err(index, "`sequence` must be a non-negative integer")),
        None => Some(sequence_from_id(id).ok_or_else(|| {
            chunk_err(index, format!("no `sequence` and none in id {id:?}"))
        })?),
    };
    if let Some(offset) = obj.get("offset") {
        if offset.as_u64().is_none() {
            return Err(chunk_err(index, "`offset` must be a non-negative integer"));
        }
    }
    let digest = non_empty(obj, index, "digest")?;
    if !is_prefixed_digest(digest) {
        return Err(chunk_err(index, format!("malformed digest {digest:?}")));
    }
    Ok((id, derived))
}

fn non_empty<'a>(obj: &'a Map<String, Value>, index: usize, key: &str) -> Checked<&'a str> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(Value::String(_)) | None => Err(chunk_err(index, format!("`{key}` is required"))),
        Some(_) => Err(chunk_err(index, format!("`{key}` must be a string"))),
    }
}

/// Check that `importer` lies within the manifest's compatibility range.
pub fn validate_compatibility(manifest: &Manifest, importer: &Version) -> Checked<()> {
    let compat = &manifest.compatibility;
    let min: Version = compat
        .min_importer_version
        .parse()
        .map_err(|e: teleport_core::version::VersionError| manifest_err(e.to_string()))?;
    let max: VersionBound = compat
        .max_importer_version
        .parse()
        .map_err(|e: teleport_core::version::VersionError| manifest_err(e.to_string()))?;

    if *importer < min {
        return Err(ValidationError::new(
            ValidationCode::ImporterTooOld,
            format!("package requires importer >= {min}, this importer is {importer}"),
        ));
    }
    if !max.admits(importer) {
        return Err(ValidationError::new(
            ValidationCode::ImporterTooNew,
            format!("package supports importers up to {max}, this importer is {importer}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use teleport_core::sha256_digest;

    fn valid_manifest() -> Value {
        let digest = sha256_digest(b"x");
        json!({
            "format_version": "1.0.0",
            "compatibility": {"min_importer_version": "0.1.0", "max_importer_version": "2.x"},
            "environment": {
                "runtime_version_min": "1.0.0",
                "host_version_min": "1.0.0",
                "table_prefix": "wp_",
                "collation": ""
            },
            "chunks": [
                {"id": "fs-000000", "type": "filesystem", "path": "a.txt", "offset": 0,
                 "sequence": 0, "size": 1, "digest": digest}
            ],
            "integrity": {"algorithm": "sha256", "global_hash": teleport_core::global_checksum([digest.as_str()])},
            "signature": {"enabled": false}
        })
    }

    fn code_of(value: &Value) -> ValidationCode {
        validate_manifest(value).unwrap_err().code
    }

    #[test]
    fn valid_manifest_passes() {
        let manifest = validate_manifest(&valid_manifest()).unwrap();
        assert_eq!(manifest.chunks.len(), 1);
        assert!(manifest.tables.is_empty());
    }

    #[test]
    fn missing_and_mistyped_fields_are_named() {
        let mut value = valid_manifest();
        value.as_object_mut().unwrap().remove("environment");
        let err = validate_manifest(&value).unwrap_err();
        assert_eq!(err.code, ValidationCode::InvalidManifest);
        assert!(err.message.contains("environment"));

        let mut value = valid_manifest();
        value["format_version"] = json!(1);
        assert_eq!(code_of(&value), ValidationCode::InvalidManifest);
    }

    #[test]
    fn version_shapes_are_enforced() {
        let mut value = valid_manifest();
        value["compatibility"]["min_importer_version"] = json!("1.x");
        assert_eq!(code_of(&value), ValidationCode::InvalidManifest);

        let mut value = valid_manifest();
        value["compatibility"]["max_importer_version"] = json!("2.1");
        assert_eq!(code_of(&value), ValidationCode::InvalidManifest);
    }

    #[test]
    fn empty_chunk_list_is_rejected() {
        let mut value = valid_manifest();
        value["chunks"] = json!([]);
        assert_eq!(code_of(&value), ValidationCode::InvalidManifest);
    }

    #[test]
    fn chunk_fields_are_checked() {
        let cases = [
            ("type", json!("archive")),
            ("size", json!(-1)),
            ("size", json!("12")),
            ("digest", json!("sha256:1234")),
            ("digest", json!("")),
            ("path", json!("../etc/passwd")),
            ("id", json!("")),
        ];
        for (key, bad) in cases {
            let mut value = valid_manifest();
            value["chunks"][0][key] = bad.clone();
            assert_eq!(
                code_of(&value),
                ValidationCode::InvalidChunk,
                "{key} = {bad}"
            );
        }
    }

    #[test]
    fn sequence_falls_back_to_the_id() {
        let mut value = valid_manifest();
        value["chunks"][0]["id"] = json!("fs-000007");
        value["chunks"][0].as_object_mut().unwrap().remove("sequence");
        let manifest = validate_manifest(&value).unwrap();
        assert_eq!(manifest.chunks[0].sequence, 7);

        value["chunks"][0]["id"] = json!("first");
        assert_eq!(code_of(&value), ValidationCode::InvalidChunk);

        value["chunks"][0]["sequence"] = json!(-3);
        assert_eq!(code_of(&value), ValidationCode::InvalidChunk);
    }

    #[test]
    fn duplicate_chunk_ids_are_rejected() {
        let mut value = valid_manifest();
        let chunk = value["chunks"][0].clone();
        value["chunks"].as_array_mut().unwrap().push(chunk);
        assert_eq!(code_of(&value), ValidationCode::InvalidChunk);
    }

    #[test]
    fn enabled_signature_requires_value() {
        let mut value = valid_manifest();
        value["signature"] = json!({"enabled": true});
        assert_eq!(code_of(&value), ValidationCode::InvalidManifest);
        value["signature"]["manifest_signature"] = json!("c2ln");
        assert!(validate_manifest(&value).is_ok());
        value["signature"] = json!({});
        assert_eq!(code_of(&value), ValidationCode::InvalidManifest);
    }

    #[test]
    fn header_checks() {
        let good = json!({
            "format": "teleport",
            "spec_version": "1.0.0",
            "created_at": "2026-01-01T00:00:00Z",
            "exporter_version": "0.1.0"
        });
        assert!(validate_header(&good).is_ok());
        for (key, bad) in [
            ("format", json!("zip")),
            ("spec_version", json!("1")),
            ("created_at", json!(" ")),
            ("exporter_version", json!(null)),
        ] {
            let mut value = good.clone();
            value[key] = bad;
            assert_eq!(
                validate_header(&value).unwrap_err().code,
                ValidationCode::InvalidHeader,
                "{key}"
            );
        }
    }

    #[test]
    fn wildcard_max_rejects_next_major() {
        let manifest = validate_manifest(&valid_manifest()).unwrap();
        let err = validate_compatibility(&manifest, &Version::new(3, 0, 0)).unwrap_err();
        assert_eq!(err.code, ValidationCode::ImporterTooNew);
        assert_eq!(err.code.family(), "UNSUPPORTED_IMPORTER_VERSION");
        assert!(validate_compatibility(&manifest, &Version::new(2, 9, 9)).is_ok());
    }

    #[test]
    fn minimum_is_inclusive() {
        let manifest = validate_manifest(&valid_manifest()).unwrap();
        assert!(validate_compatibility(&manifest, &Version::new(0, 1, 0)).is_ok());
        let err = validate_compatibility(&manifest, &Version::new(0, 0, 9)).unwrap_err();
        assert_eq!(err.code, ValidationCode::ImporterTooOld);
        assert_eq!(err.code.family(), "UNSUPPORTED_IMPORTER_VERSION");
    }

    #[test]
    fn exact_max_is_inclusive() {
        let mut value = valid_manifest();
        value["compatibility"]["max_importer_version"] = json!("1.2.3");
        let manifest = validate_manifest(&value).unwrap();
        assert!(validate_compatibility(&manifest, &Version::new(1, 2, 3)).is_ok());
        assert!(validate_compatibility(&manifest, &Version::new(1, 2, 4)).is_err());
    }
}
