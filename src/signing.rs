//! Ed25519 signing and verification of cache entries.
//!
//! A signature covers the entry fingerprint `"1;<store-path>;<nar-hash>"`,
//! binding the identifier and the content hash together so a signature for
//! one path can never validate another. Keys and signatures render as
//! `name:base64(raw bytes)`, the same form used in key files and narinfo
//! records. Secret keys never serialize and never appear in logs.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::integrity::NarHash;
use crate::store_path::StorePath;

/// The signed message for a cache entry. Version-prefixed so the scheme can
/// evolve without old signatures validating new messages.
pub fn fingerprint(path: &StorePath, nar_hash: &NarHash) -> String {
    format!("1;{};{}", path.render(), nar_hash.render())
}

/// A detached signature: `(key name, 64 signature bytes)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature {
    key_name: String,
    bytes: Vec<u8>,
}

impl Signature {
    /// Parse the rendered form `name:base64(sig)`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (name, b64) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed signature '{}'", s))?;
        if name.is_empty() {
            return Err(format!("signature with empty key name: '{}'", s));
        }
        let bytes = BASE64
            .decode(b64.trim())
            .map_err(|e| format!("bad signature encoding: {}", e))?;
        if bytes.len() != 64 {
            return Err(format!("signature must be 64 bytes, got {}", bytes.len()));
        }
        Ok(Self {
            key_name: name.to_string(),
            bytes,
        })
    }

    /// Name of the key that produced this signature.
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Rendered form `name:base64(sig)`.
    pub fn render(&self) -> String {
        format!("{}:{}", self.key_name, BASE64.encode(&self.bytes))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl TryFrom<String> for Signature {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        Signature::parse(&s)
    }
}

impl From<Signature> for String {
    fn from(s: Signature) -> String {
        s.render()
    }
}

/// A named Ed25519 verifying key.
#[derive(Clone)]
pub struct PublicKey {
    name: String,
    key: VerifyingKey,
}

impl PublicKey {
    /// Parse the rendered form `name:base64(32 raw bytes)`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (name, b64) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed public key '{}'", s))?;
        let bytes = BASE64
            .decode(b64.trim())
            .map_err(|e| format!("bad public key encoding: {}", e))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "public key must be 32 bytes".to_string())?;
        let key = VerifyingKey::from_bytes(&arr).map_err(|e| format!("invalid public key: {}", e))?;
        Ok(Self {
            name: name.to_string(),
            key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render(&self) -> String {
        format!("{}:{}", self.name, BASE64.encode(self.key.as_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.name)
    }
}

/// A named Ed25519 signing key. The private half never leaves this process:
/// no `Serialize`, no `Debug` exposure, file I/O only on explicit request.
pub struct SecretKey {
    name: String,
    key: SigningKey,
}

impl SecretKey {
    /// Generate a fresh key pair under the given key name.
    pub fn generate(name: &str) -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            name: name.to_string(),
            key: SigningKey::generate(&mut rng),
        }
    }

    /// Parse the rendered form `name:base64(32 seed bytes)`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (name, b64) = s
            .split_once(':')
            .ok_or_else(|| "malformed secret key".to_string())?;
        let bytes = BASE64
            .decode(b64.trim())
            .map_err(|e| format!("bad secret key encoding: {}", e))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "secret key must be 32 bytes".to_string())?;
        Ok(Self {
            name: name.to_string(),
            key: SigningKey::from_bytes(&arr),
        })
    }

    /// Load from a key file containing a single `name:base64(seed)` line.
    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::io("read secret key", Some(&path.to_string_lossy()), e))?;
        Self::parse(content.trim()).map_err(|e| SyncError::Store {
            operation: "read secret key".to_string(),
            detail: e,
        })
    }

    /// Write the rendered key to a file.
    pub fn to_file(&self, path: &Path) -> Result<(), SyncError> {
        let rendered = format!("{}:{}\n", self.name, BASE64.encode(self.key.to_bytes()));
        std::fs::write(path, rendered)
            .map_err(|e| SyncError::io("write secret key", Some(&path.to_string_lossy()), e))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            name: self.name.clone(),
            key: self.key.verifying_key(),
        }
    }

    /// Sign an entry fingerprint.
    pub fn sign(&self, fingerprint: &str) -> Signature {
        let sig = self.key.sign(fingerprint.as_bytes());
        Signature {
            key_name: self.name.clone(),
            bytes: sig.to_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({}:<private>)", self.name)
    }
}

/// The immutable set of keys this process trusts. Built at startup and
/// threaded explicitly into verification; multiple sets can coexist.
#[derive(Clone, Debug, Default)]
pub struct TrustedKeys {
    keys: HashMap<String, VerifyingKey>,
}

impl TrustedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from rendered public keys.
    pub fn from_rendered(rendered: &[String]) -> Result<Self, String> {
        let mut set = Self::new();
        for s in rendered {
            set = set.with_key(PublicKey::parse(s)?);
        }
        Ok(set)
    }

    /// Add a trusted key (builder style; the set is immutable once in use).
    pub fn with_key(mut self, key: PublicKey) -> Self {
        self.keys.insert(key.name, key.key);
        self
    }

    /// Accept iff at least one signature comes from a trusted key and
    /// validates over the exact fingerprint. Unknown key names and invalid
    /// signatures fail closed.
    pub fn verify(
        &self,
        path: &StorePath,
        fingerprint: &str,
        signatures: &[Signature],
    ) -> Result<(), SyncError> {
        let mut unknown: Option<String> = None;
        for sig in signatures {
            match self.keys.get(&sig.key_name) {
                Some(key) => {
                    let arr: [u8; 64] = match sig.bytes.as_slice().try_into() {
                        Ok(arr) => arr,
                        Err(_) => continue,
                    };
                    let dalek_sig = ed25519_dalek::Signature::from_bytes(&arr);
                    if key.verify(fingerprint.as_bytes(), &dalek_sig).is_ok() {
                        return Ok(());
                    }
                }
                None => {
                    if unknown.is_none() {
                        unknown = Some(sig.key_name.clone());
                    }
                }
            }
        }
        Err(SyncError::UntrustedSigner {
            path: path.render(),
            key_name: unknown,
        })
    }
}
