//! Integrity hashes for archive payloads (SRI style, e.g. "sha256-abc123...").
//! The same SHA-256 digest family also mints store path identifiers, so
//! verification is: recompute, compare against the claimed identifier.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SyncError;
use crate::store_path::StorePath;

/// A content hash over uncompressed archive bytes, rendered "sha256-<base64>".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NarHash {
    hash: String,
}

impl NarHash {
    /// Compute the hash of archive bytes.
    pub fn compute(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Self {
            hash: BASE64.encode(digest),
        }
    }

    /// Parse an SRI string (e.g. "sha256-abc123...").
    pub fn parse(sri: &str) -> Result<Self, String> {
        let sri = sri.trim();
        let (algo, hash) = sri
            .split_once('-')
            .ok_or_else(|| format!("invalid integrity hash: {}", sri))?;
        if algo != "sha256" || hash.is_empty() {
            return Err(format!("unsupported integrity hash: {}", sri));
        }
        Ok(Self {
            hash: hash.to_string(),
        })
    }

    /// Verify content against this hash.
    pub fn matches(&self, content: &[u8]) -> bool {
        NarHash::compute(content) == *self
    }

    /// The SRI rendering "sha256-<base64>".
    pub fn render(&self) -> String {
        format!("sha256-{}", self.hash)
    }
}

impl std::fmt::Display for NarHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256-{}", self.hash)
    }
}

impl TryFrom<String> for NarHash {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        NarHash::parse(&s)
    }
}

impl From<NarHash> for String {
    fn from(h: NarHash) -> String {
        h.render()
    }
}

/// Check archive bytes against a declared content hash, reporting the owning
/// store path on mismatch. The caller must discard the bytes on error.
pub fn verify_nar(path: &StorePath, nar_hash: &NarHash, content: &[u8]) -> Result<(), SyncError> {
    let actual = NarHash::compute(content);
    if actual != *nar_hash {
        return Err(SyncError::IntegrityViolation {
            path: path.render(),
            expected: nar_hash.render(),
            actual: actual.render(),
        });
    }
    Ok(())
}

/// Check that a store path's identifier really derives from its content and
/// references. This is the tamper-detection boundary: identifiers are minted
/// from content, so re-minting must reproduce the claimed identifier exactly.
pub fn verify_path(
    path: &StorePath,
    archive_bytes: &[u8],
    references: &[StorePath],
) -> Result<(), SyncError> {
    let reminted = StorePath::mint(path.name(), archive_bytes, references)
        .map_err(|e| SyncError::Store {
            operation: "verify_path".to_string(),
            detail: e,
        })?;
    if reminted != *path {
        return Err(SyncError::IntegrityViolation {
            path: path.render(),
            expected: path.hash().to_string(),
            actual: reminted.hash().to_string(),
        });
    }
    Ok(())
}
