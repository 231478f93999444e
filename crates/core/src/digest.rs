//! Content digest of a kit.
//!
//! The digest covers the kit spec and status, excluding the `digest` and
//! `observedGeneration` fields that are stamped around it. Struct fields
//! serialize in declaration order and maps are sorted, so equal content
//! always hashes to the same value.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::Kit;

#[derive(Debug, Error)]
#[error("computing kit digest: {0}")]
pub struct DigestError(#[from] serde_json::Error);

pub fn kit_digest(kit: &Kit) -> Result<String, DigestError> {
    let mut status = kit.status.clone().unwrap_or_default();
    status.digest.clear();
    status.observed_generation = None;

    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&kit.spec)?);
    hasher.update(b"\n");
    hasher.update(serde_json::to_vec(&status)?);
    Ok(format!("v{}", URL_SAFE_NO_PAD.encode(hasher.finalize())))
}
