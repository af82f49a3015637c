//! Error types for cache synchronization.
//! Every failure names the store path it concerns and the violation kind;
//! callers never see a generic "cache error".

use std::fmt;

/// Main error type for narsync operations.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// The reference graph contains a cycle. Fatal to closure resolution.
    CycleDetected {
        path: String,
    },
    /// Archive encode/decode hit an entry that is not a file, directory or symlink.
    UnsupportedEntryKind {
        path: String,
        kind: String,
    },
    /// Compressed payload was malformed or truncated. Retryable by re-downloading.
    Decompression {
        path: String,
        source: String,
    },
    /// Recomputed content hash disagrees with the claimed identifier.
    /// The entry must be discarded; never retried with the same bytes.
    IntegrityViolation {
        path: String,
        expected: String,
        actual: String,
    },
    /// No signature from a trusted key validated. Fails closed.
    UntrustedSigner {
        path: String,
        key_name: Option<String>,
    },
    /// Network failure at the transport boundary.
    Transfer {
        operation: String,
        url: Option<String>,
        status: Option<u16>,
        source: String,
        retryable: bool,
    },
    /// Local filesystem failure.
    Io {
        operation: String,
        path: Option<String>,
        source: String,
    },
    /// Store backend (dependency-graph oracle) failure.
    Store {
        operation: String,
        detail: String,
    },
}

impl SyncError {
    /// Whether the calling session may retry the operation that produced this error.
    /// Integrity and trust failures are never retryable with the same bytes.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transfer { retryable, .. } => *retryable,
            SyncError::Decompression { .. } => true,
            _ => false,
        }
    }

    /// The store path this error concerns, when there is one.
    pub fn store_path(&self) -> Option<&str> {
        match self {
            SyncError::CycleDetected { path }
            | SyncError::UnsupportedEntryKind { path, .. }
            | SyncError::Decompression { path, .. }
            | SyncError::IntegrityViolation { path, .. }
            | SyncError::UntrustedSigner { path, .. } => Some(path),
            SyncError::Io { path, .. } => path.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn io(operation: &str, path: Option<&str>, source: std::io::Error) -> Self {
        SyncError::Io {
            operation: operation.to_string(),
            path: path.map(String::from),
            source: source.to_string(),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::CycleDetected { path } => {
                write!(f, "reference cycle detected at {}", path)
            }
            SyncError::UnsupportedEntryKind { path, kind } => {
                write!(f, "unsupported entry kind '{}' in {}", kind, path)
            }
            SyncError::Decompression { path, source } => {
                write!(f, "failed to decompress {}: {}", path, source)
            }
            SyncError::IntegrityViolation { path, expected, actual } => {
                write!(
                    f,
                    "integrity violation for {}: expected {}, got {}",
                    path, expected, actual
                )
            }
            SyncError::UntrustedSigner { path, key_name } => {
                write!(f, "no trusted signature for {}", path)?;
                if let Some(key) = key_name {
                    write!(f, " (signed by unknown key '{}')", key)?;
                }
                Ok(())
            }
            SyncError::Transfer { operation, url, status, source, retryable } => {
                write!(f, "transfer error in {}: {}", operation, source)?;
                if let Some(url) = url {
                    write!(f, " (url: {})", url)?;
                }
                if let Some(status) = status {
                    write!(f, " (status: {})", status)?;
                }
                if *retryable {
                    write!(f, " [retryable]")?;
                }
                Ok(())
            }
            SyncError::Io { operation, path, source } => {
                write!(f, "I/O error in {}: {}", operation, source)?;
                if let Some(path) = path {
                    write!(f, " (path: {})", path)?;
                }
                Ok(())
            }
            SyncError::Store { operation, detail } => {
                write!(f, "store error in {}: {}", operation, detail)
            }
        }
    }
}

impl std::error::Error for SyncError {}
