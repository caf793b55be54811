//! `validate_environment`: read-only checks of the target against the
//! package's environment block.

use std::fs;

use teleport_core::disk::{disk_free_bytes, has_room};
use teleport_core::paths::{normalize_relative_path, write_file_atomic};
use teleport_core::{HostEnvironment, Version};
use teleport_package::EnvironmentRequirements;

use super::{ImportEngine, ImportJob, PhaseOutcome, loaded_manifest};
use crate::error::{EngineError, EngineResult};

fn mismatch(code: &'static str, message: String) -> EngineError {
    EngineError::EnvironmentMismatch { code, message }
}

fn check_floor(
    what: &str,
    required: &str,
    actual: &str,
    code: &'static str,
) -> EngineResult<()> {
    if required.trim().is_empty() {
        return Ok(());
    }
    let required_v: Version = required
        .parse()
        .map_err(|e| mismatch(code, format!("{what} requirement {required:?}: {e}")))?;
    let actual_v: Version = actual
        .parse()
        .map_err(|e| mismatch(code, format!("{what} version {actual:?}: {e}")))?;
    if actual_v < required_v {
        return Err(mismatch(
            code,
            format!("{what} version {actual_v} is older than required {required_v}"),
        ));
    }
    Ok(())
}

/// Compare host facts against the package requirements.
pub(crate) fn check_requirements(
    required: &EnvironmentRequirements,
    host: &HostEnvironment,
) -> EngineResult<()> {
    check_floor(
        "runtime",
        &required.runtime_version_min,
        &host.runtime_version,
        "RUNTIME_VERSION_TOO_OLD",
    )?;
    check_floor(
        "host",
        &required.host_version_min,
        &host.host_version,
        "HOST_VERSION_TOO_OLD",
    )?;
    if required.table_prefix != host.table_prefix {
        return Err(mismatch(
            "TABLE_PREFIX_MISMATCH",
            format!(
                "package table prefix {:?} differs from {:?}",
                required.table_prefix, host.table_prefix
            ),
        ));
    }
    let collation_ok = required.collation.is_empty()
        || host.collation.is_empty()
        || required.collation.eq_ignore_ascii_case(&host.collation);
    if !collation_ok {
        return Err(mismatch(
            "COLLATION_MISMATCH",
            format!(
                "package collation {:?} differs from {:?}",
                required.collation, host.collation
            ),
        ));
    }
    Ok(())
}

impl ImportEngine<'_> {
    pub(super) fn validate_environment(&self, job: &mut ImportJob) -> EngineResult<PhaseOutcome> {
        if job.checkpoints.environment.complete {
            return Ok(PhaseOutcome::Complete);
        }
        let manifest = loaded_manifest(job.manifest.as_ref())?;
        check_requirements(&manifest.environment, &self.config.environment)?;

        for path in manifest.file_paths() {
            normalize_relative_path(&path)?;
        }

        let probe = job.staging_dir.join(".probe");
        let probe_ok = write_file_atomic(&probe, b"teleport")
            .and_then(|()| fs::read(&probe))
            .map(|bytes| bytes == b"teleport");
        let _ = fs::remove_file(&probe);
        if !matches!(probe_ok, Ok(true)) {
            return Err(EngineError::EnvironmentUnavailable {
                code: "STAGING_NOT_WRITABLE",
                message: format!(
                    "staging directory is not readable and writable: {}",
                    probe_ok.err().map_or_else(|| "content mismatch".to_string(), |e| e.to_string())
                ),
            });
        }

        if !job.target_root.is_dir() {
            return Err(EngineError::EnvironmentUnavailable {
                code: "TARGET_MISSING",
                message: format!("target root {} is missing", job.target_root.display()),
            });
        }
        let needed = job.checkpoints.stage.staged_bytes;
        let free = disk_free_bytes(&job.target_root)?;
        if !has_room(free, needed, self.config.disk_headroom_bytes) {
            return Err(EngineError::EnvironmentUnavailable {
                code: "INSUFFICIENT_DISK",
                message: format!(
                    "{free} bytes free, {needed} bytes needed plus {} headroom",
                    self.config.disk_headroom_bytes
                ),
            });
        }

        job.checkpoints.environment.complete = true;
        job.log.info(
            &job.id,
            "validate_environment",
            "TP-IMP-ENV-OK",
            format!("environment accepted, {free} bytes free"),
        );
        Ok(PhaseOutcome::Complete)
    }
}
