//! Cache entry metadata ("narinfo"): everything a client needs to decide
//! whether to fetch an archive and how to verify it afterwards.

use serde::{Deserialize, Serialize};

use crate::compress::Compression;
use crate::error::SyncError;
use crate::integrity::NarHash;
use crate::signing::{fingerprint, SecretKey, Signature};
use crate::store_path::StorePath;

/// Metadata half of a cache entry. The payload half is the compressed archive.
/// An entry is never visible to readers until both halves are complete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarInfo {
    /// Identifier of the store path this entry realizes.
    pub store_path: StorePath,
    /// Hash of the uncompressed archive bytes.
    pub nar_hash: NarHash,
    /// Size of the uncompressed archive in bytes.
    pub nar_size: u64,
    /// Codec applied to the stored payload.
    pub compression: Compression,
    /// Direct references of the store path, so clients can walk the closure
    /// without a local copy.
    pub references: Vec<StorePath>,
    /// Accumulated signatures; any one from a trusted key suffices.
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

impl NarInfo {
    pub fn new(
        store_path: StorePath,
        nar_hash: NarHash,
        nar_size: u64,
        compression: Compression,
        references: Vec<StorePath>,
    ) -> Self {
        let mut references = references;
        references.sort();
        references.dedup();
        Self {
            store_path,
            nar_hash,
            nar_size,
            compression,
            references,
            signatures: Vec::new(),
        }
    }

    /// The signed message for this entry.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.store_path, &self.nar_hash)
    }

    /// Sign this entry, accumulating alongside existing signatures.
    pub fn sign(&mut self, key: &SecretKey) {
        let sig = key.sign(&self.fingerprint());
        self.add_signature(sig);
    }

    /// Add a signature unless an identical one is already present.
    pub fn add_signature(&mut self, sig: Signature) {
        if !self.signatures.contains(&sig) {
            self.signatures.push(sig);
        }
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Store {
            operation: "serialize narinfo".to_string(),
            detail: e.to_string(),
        })
    }

    pub fn from_json(s: &str) -> Result<Self, SyncError> {
        serde_json::from_str(s).map_err(|e| SyncError::Store {
            operation: "parse narinfo".to_string(),
            detail: e.to_string(),
        })
    }
}
