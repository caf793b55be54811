//! Ed25519 manifest signing.
//!
//! The signed payload is the manifest serialized with
//! `signature.manifest_signature` cleared, so the signature travels inside
//! the document it covers.

use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::manifest::{Manifest, SignatureBlock};
use crate::{PackageError, PackageResult};

pub const SIGNATURE_ALGORITHM: &str = "ed25519";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureCheck {
    /// The manifest carries no signature.
    Unsigned,
    /// Signature verified against the returned base64 public key.
    Verified { public_key: String },
}

fn sig_err(message: impl Into<String>) -> PackageError {
    PackageError::Signature {
        message: message.into(),
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(data)
}

/// Load a signing key file holding a 32-byte seed (or a 64-byte expanded
/// key, of which the first 32 bytes are the seed).
fn load_signing_key(path: &Path) -> PackageResult<SigningKey> {
    let key_bytes = std::fs::read(path)?;
    if key_bytes.len() != 32 && key_bytes.len() != 64 {
        return Err(sig_err(format!(
            "signing key must be 32 or 64 bytes, got {}",
            key_bytes.len()
        )));
    }
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&key_bytes[..32]);
    Ok(SigningKey::from_bytes(&seed))
}

fn signing_payload(manifest: &Manifest) -> PackageResult<Vec<u8>> {
    let mut unsigned = manifest.clone();
    unsigned.signature.manifest_signature = None;
    serde_json::to_vec(&unsigned).map_err(|e| sig_err(e.to_string()))
}

/// Sign `manifest` in place with the key stored at `key_path`.
pub fn sign_manifest(manifest: &mut Manifest, key_path: &Path) -> PackageResult<()> {
    let signing_key = load_signing_key(key_path)?;
    manifest.signature = SignatureBlock {
        enabled: true,
        algorithm: Some(SIGNATURE_ALGORITHM.to_string()),
        manifest_signature: None,
        public_key: Some(base64_encode(signing_key.verifying_key().as_bytes())),
    };
    let payload = signing_payload(manifest)?;
    let signature = signing_key.sign(&payload);
    manifest.signature.manifest_signature = Some(base64_encode(&signature.to_bytes()));
    Ok(())
}

/// Verify the manifest's signature block.
///
/// `trusted_key` (base64) overrides the key embedded in the manifest; without
/// it the check only proves the manifest was not altered after signing.
pub fn verify_manifest_signature(
    manifest: &Manifest,
    trusted_key: Option<&str>,
) -> PackageResult<SignatureCheck> {
    let block = &manifest.signature;
    if !block.enabled {
        return Ok(SignatureCheck::Unsigned);
    }
    if let Some(algorithm) = block.algorithm.as_deref() {
        if !algorithm.eq_ignore_ascii_case(SIGNATURE_ALGORITHM) {
            return Err(sig_err(format!("unsupported algorithm {algorithm:?}")));
        }
    }
    let public_key = trusted_key
        .or(block.public_key.as_deref())
        .ok_or_else(|| sig_err("no public key available"))?;
    let key_bytes: [u8; 32] = base64_decode(public_key)
        .map_err(|e| sig_err(format!("public key: {e}")))?
        .try_into()
        .map_err(|_| sig_err("public key must be 32 bytes"))?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|e| sig_err(format!("public key: {e}")))?;

    let sig_b64 = block
        .manifest_signature
        .as_deref()
        .ok_or_else(|| sig_err("signature missing"))?;
    let sig_bytes: [u8; 64] = base64_decode(sig_b64)
        .map_err(|e| sig_err(format!("signature: {e}")))?
        .try_into()
        .map_err(|_| sig_err("signature must be 64 bytes"))?;
    let signature = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify(&signing_payload(manifest)?, &signature)
        .map_err(|_| sig_err("manifest signature does not verify"))?;
    Ok(SignatureCheck::Verified {
        public_key: public_key.to_string(),
    })
}

/// Write a fresh 32-byte seed to `path` and return the base64 public key.
pub fn generate_signing_key(path: &Path) -> PackageResult<String> {
    let mut seed = [0u8; 32];
    getrandom::getrandom(&mut seed).map_err(|e| sig_err(format!("random source: {e}")))?;
    teleport_core::paths::write_file_atomic(path, &seed)?;
    let key = SigningKey::from_bytes(&seed);
    Ok(base64_encode(key.verifying_key().as_bytes()))
}
