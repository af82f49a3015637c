//! Store path identifiers.
//!
//! A store path is rendered as `<hash>-<name>`, where `hash` is the first 32
//! lowercase-hex characters of the SHA-256 digest over the path's canonical
//! archive bytes followed by the sorted rendered identifiers of its direct
//! references (one per line). The hash is content-derived, so a closure is
//! self-verifying: tampering with any path changes every downstream hash.
//! Both rules are part of the on-wire format and must not change.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the hash component in rendered form (hex chars).
pub const HASH_LEN: usize = 32;

/// A content-addressed store path identifier: `(hash, name)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorePath {
    hash: String,
    name: String,
}

impl StorePath {
    /// Build from already-validated components.
    pub fn new(hash: &str, name: &str) -> Result<Self, String> {
        if hash.len() != HASH_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(format!(
                "store path hash must be {} lowercase hex chars, got '{}'",
                HASH_LEN, hash
            ));
        }
        if name.is_empty() || name.contains('/') || name.contains('\n') {
            return Err(format!("invalid store path name '{}'", name));
        }
        Ok(Self {
            hash: hash.to_string(),
            name: name.to_string(),
        })
    }

    /// Parse a rendered identifier of the form `<hash>-<name>`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        // Strip a leading store directory if one was passed.
        let s = s.rsplit('/').next().unwrap_or(s);
        if s.len() < HASH_LEN + 2 || s.as_bytes().get(HASH_LEN) != Some(&b'-') {
            return Err(format!("malformed store path '{}'", s));
        }
        Self::new(&s[..HASH_LEN], &s[HASH_LEN + 1..])
    }

    /// Mint a new identifier from content: the canonical archive bytes of the
    /// subtree and the path's direct references.
    pub fn mint(name: &str, archive_bytes: &[u8], references: &[StorePath]) -> Result<Self, String> {
        let mut refs: Vec<String> = references.iter().map(|r| r.render()).collect();
        refs.sort();
        refs.dedup();

        let mut hasher = Sha256::new();
        hasher.update(archive_bytes);
        for r in &refs {
            hasher.update(r.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self::new(&hex[..HASH_LEN], name)
    }

    /// The hash component of the identifier.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The human-readable name component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rendered form `<hash>-<name>`.
    pub fn render(&self) -> String {
        format!("{}-{}", self.hash, self.name)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.hash, self.name)
    }
}

impl TryFrom<String> for StorePath {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        StorePath::parse(&s)
    }
}

impl From<StorePath> for String {
    fn from(p: StorePath) -> String {
        p.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_and_parse_round_trip() {
        let p = StorePath::mint("hello-1.0", b"archive bytes", &[]).unwrap();
        assert_eq!(p.hash().len(), HASH_LEN);

        let parsed = StorePath::parse(&p.render()).unwrap();
        assert_eq!(parsed, p);
    }

    #[test]
    fn test_mint_depends_on_content_and_references() {
        let dep = StorePath::mint("dep-1.0", b"dep", &[]).unwrap();

        let a = StorePath::mint("pkg-1.0", b"content", &[]).unwrap();
        let b = StorePath::mint("pkg-1.0", b"other content", &[]).unwrap();
        let c = StorePath::mint("pkg-1.0", b"content", &[dep]).unwrap();

        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_mint_reference_order_is_canonical() {
        let x = StorePath::mint("x-1.0", b"x", &[]).unwrap();
        let y = StorePath::mint("y-1.0", b"y", &[]).unwrap();

        let fwd = StorePath::mint("pkg-1.0", b"content", &[x.clone(), y.clone()]).unwrap();
        let rev = StorePath::mint("pkg-1.0", b"content", &[y, x]).unwrap();
        assert_eq!(fwd, rev);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(StorePath::parse("not-a-store-path").is_err());
        assert!(StorePath::parse("").is_err());
        // Uppercase hash component is not canonical.
        let p = StorePath::mint("hello", b"x", &[]).unwrap();
        let upper = p.render().to_uppercase();
        assert!(StorePath::parse(&upper).is_err());
    }

    #[test]
    fn test_parse_strips_store_dir() {
        let p = StorePath::mint("hello", b"x", &[]).unwrap();
        let with_dir = format!("/var/store/{}", p.render());
        assert_eq!(StorePath::parse(&with_dir).unwrap(), p);
    }
}
