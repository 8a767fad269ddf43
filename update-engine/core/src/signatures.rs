//! Detached Ed25519 signatures over the artifact manifest.
//!
//! The `manifest.sig` member carries a base64 encoded Ed25519 signature of
//! the raw bytes of the `manifest` member. Whether a signature is required
//! at all is decided by [`VerifyPolicy`], derived from the engine settings.

use std::{fs, io, path::Path};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH};

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("a verification key is configured but the artifact carries no signature")]
    MissingSignature,
    #[error("failed decoding signature from base64")]
    Base64Decode(#[from] base64::DecodeError),
    #[error("signature has wrong length; expected {expected} bytes, got {actual}")]
    MalformedSignature { expected: usize, actual: usize },
    #[error("signature did not match the manifest under the configured key")]
    InvalidSignature(#[source] ed25519_dalek::SignatureError),
}

#[derive(Debug, thiserror::Error)]
pub enum KeyLoadError {
    #[error("failed reading verification key from `{path}`")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed decoding verification key from base64")]
    Base64Decode(#[from] base64::DecodeError),
    #[error("verification key has wrong length; expected {PUBLIC_KEY_LENGTH} bytes, got {actual}")]
    MalformedKey { actual: usize },
    #[error("bytes do not form a valid Ed25519 public key")]
    InvalidKey(#[source] ed25519_dalek::SignatureError),
}

/// How the engine treats artifact signatures.
///
/// Signing is all-or-nothing: with a configured key every artifact must
/// carry a valid signature, without one any signature present is ignored.
#[derive(Debug, Clone)]
pub enum VerifyPolicy {
    AcceptUnsigned,
    Require(VerifyingKey),
}

impl VerifyPolicy {
    /// Applies the policy to a manifest and the signature member found next
    /// to it, if any.
    pub fn verify(
        &self,
        manifest_bytes: &[u8],
        signature: Option<&str>,
    ) -> Result<(), SignatureError> {
        let key = match self {
            VerifyPolicy::AcceptUnsigned => return Ok(()),
            VerifyPolicy::Require(key) => key,
        };
        let signature = signature.ok_or(SignatureError::MissingSignature)?;
        verify_signature(key, manifest_bytes, signature)
    }
}

/// Checks a base64 encoded detached signature against `msg` under `key`.
pub fn verify_signature(
    key: &VerifyingKey,
    msg: &[u8],
    base64_signature: &str,
) -> Result<(), SignatureError> {
    let decoded = BASE64_STANDARD.decode(base64_signature.trim())?;
    let decoded: &[u8; Signature::BYTE_SIZE] = decoded.as_slice().try_into().map_err(|_| {
        SignatureError::MalformedSignature {
            expected: Signature::BYTE_SIZE,
            actual: decoded.len(),
        }
    })?;
    let signature = Signature::from_bytes(decoded);
    key.verify_strict(msg, &signature)
        .map_err(SignatureError::InvalidSignature)
}

/// Loads an Ed25519 public key from `path`. The file holds either the raw
/// 32 key bytes as hex or the base64 encoding the signing tooling emits.
pub fn load_verifying_key(path: &Path) -> Result<VerifyingKey, KeyLoadError> {
    let text = fs::read_to_string(path).map_err(|source| KeyLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    decode_verifying_key(text.trim())
}

pub fn decode_verifying_key(key: &str) -> Result<VerifyingKey, KeyLoadError> {
    let decoded = match hex::decode(key) {
        Ok(bytes) => bytes,
        Err(_) => BASE64_STANDARD.decode(key)?,
    };
    let decoded: &[u8; PUBLIC_KEY_LENGTH] = decoded
        .as_slice()
        .try_into()
        .map_err(|_| KeyLoadError::MalformedKey {
            actual: decoded.len(),
        })?;
    VerifyingKey::from_bytes(decoded).map_err(KeyLoadError::InvalidKey)
}
