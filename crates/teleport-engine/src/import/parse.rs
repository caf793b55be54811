//! `parse_manifest`: archive inspection, document validation and digest
//! re-verification. Reads the package only.

use teleport_package::{
    PackageError, PackageReader, SignatureCheck, validate_compatibility,
    verify_manifest_signature, verify_chunk,
};

use super::{ImportEngine, ImportJob, PhaseOutcome, loaded_manifest};
use crate::budget::Budget;
use crate::error::EngineResult;

impl ImportEngine<'_> {
    pub(super) fn parse_manifest(
        &self,
        job: &mut ImportJob,
        budget: &mut Budget,
    ) -> EngineResult<PhaseOutcome> {
        if job.checkpoints.parse.complete {
            return Ok(PhaseOutcome::Complete);
        }
        let mut reader = PackageReader::open(&job.archive_path)?;
        if job.manifest.is_none() {
            let header = reader.read_header()?;
            let manifest = reader.read_manifest()?;
            validate_compatibility(&manifest, &self.importer_version).map_err(PackageError::from)?;
            let check = verify_manifest_signature(&manifest, self.trusted_key.as_deref())?;
            if let SignatureCheck::Verified { public_key } = &check {
                job.signer = Some(public_key.clone());
            } else if self.trusted_key.is_some() {
                return Err(PackageError::Signature {
                    message: "package is unsigned but a trusted key is configured".into(),
                }
                .into());
            }
            job.log.info(
                &job.id,
                "parse_manifest",
                "TP-IMP-MANIFEST",
                format!(
                    "package from exporter {} with {} chunks{}",
                    header.exporter_version,
                    manifest.chunks.len(),
                    if job.signer.is_some() { ", signature verified" } else { "" }
                ),
            );
            job.manifest = Some(manifest);
        }

        let manifest = loaded_manifest(job.manifest.as_ref())?;
        while job.checkpoints.parse.verified < manifest.chunks.len() {
            if budget.exhausted() {
                return Ok(PhaseOutcome::Continue);
            }
            verify_chunk(&mut reader, &manifest.chunks[job.checkpoints.parse.verified])?;
            job.checkpoints.parse.verified += 1;
            budget.tick();
        }

        let actual = manifest.compute_global_checksum();
        if !actual.eq_ignore_ascii_case(&manifest.integrity.global_hash) {
            return Err(PackageError::GlobalChecksumMismatch {
                expected: manifest.integrity.global_hash.clone(),
                actual,
            }
            .into());
        }
        job.checkpoints.parse.complete = true;
        Ok(PhaseOutcome::Complete)
    }
}
