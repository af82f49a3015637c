//! Store backend seam: the dependency-graph oracle and artifact producer.
//!
//! The build tool behind the store is opaque to the sync engine; everything
//! it needs goes through `StoreBackend`. `LocalStore` implements it over a
//! plain directory store with JSON reference sidecars, which is also what the
//! tests use (no real build tool required).

use std::fs;
use std::path::{Path, PathBuf};

use crate::archive;
use crate::error::SyncError;
use crate::store_path::StorePath;

/// Narrow interface to the local store and its reference graph.
/// The engine treats answers as authoritative.
pub trait StoreBackend: Send + Sync {
    /// The direct references of a store path.
    fn direct_references(&self, path: &StorePath) -> Result<Vec<StorePath>, SyncError>;

    /// Whether the path is present and complete in the local store.
    fn contains(&self, path: &StorePath) -> bool;

    /// Location of the path's subtree on disk, for archiving.
    fn realize(&self, path: &StorePath) -> Result<PathBuf, SyncError>;

    /// Install a fetched path: decode the archive into the store and record
    /// its references. Must be atomic — a partially installed path is never
    /// visible. Installing an already-present path is a no-op.
    fn materialize(
        &self,
        path: &StorePath,
        nar_bytes: &[u8],
        references: &[StorePath],
    ) -> Result<(), SyncError>;
}

/// A directory-backed store: subtrees at `<root>/<hash>-<name>/`, reference
/// lists at `<root>/.narsync/refs/<hash>-<name>.json`.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn open(root: &Path) -> Result<Self, SyncError> {
        let store = Self {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(store.refs_dir())
            .map_err(|e| SyncError::io("open store", Some(&root.to_string_lossy()), e))?;
        fs::create_dir_all(store.tmp_dir())
            .map_err(|e| SyncError::io("open store", Some(&root.to_string_lossy()), e))?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn refs_dir(&self) -> PathBuf {
        self.root.join(".narsync").join("refs")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(".narsync").join("tmp")
    }

    fn path_dir(&self, path: &StorePath) -> PathBuf {
        self.root.join(path.render())
    }

    fn refs_file(&self, path: &StorePath) -> PathBuf {
        self.refs_dir().join(format!("{}.json", path.render()))
    }

    /// Add a locally built subtree to the store, minting its identifier from
    /// content and references. Returns the minted path.
    pub fn add_path(
        &self,
        name: &str,
        subtree: &Path,
        references: &[StorePath],
    ) -> Result<StorePath, SyncError> {
        let nar = archive::encode(subtree)?;
        let path = StorePath::mint(name, &nar, references).map_err(|e| SyncError::Store {
            operation: "add path".to_string(),
            detail: e,
        })?;
        self.materialize(&path, &nar, references)?;
        Ok(path)
    }

    /// All store paths currently present, unordered.
    pub fn all_paths(&self) -> Result<Vec<StorePath>, SyncError> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.root)
            .map_err(|e| SyncError::io("list store", Some(&self.root.to_string_lossy()), e))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| SyncError::io("list store", Some(&self.root.to_string_lossy()), e))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(path) = StorePath::parse(name) {
                    if self.contains(&path) {
                        out.push(path);
                    }
                }
            }
        }
        Ok(out)
    }

    fn write_refs(&self, file: &Path, references: &[StorePath]) -> Result<(), SyncError> {
        let rendered: Vec<String> = references.iter().map(|r| r.render()).collect();
        let json = serde_json::to_string(&rendered).map_err(|e| SyncError::Store {
            operation: "write references".to_string(),
            detail: e.to_string(),
        })?;
        fs::write(file, json)
            .map_err(|e| SyncError::io("write references", Some(&file.to_string_lossy()), e))
    }
}

impl StoreBackend for LocalStore {
    fn direct_references(&self, path: &StorePath) -> Result<Vec<StorePath>, SyncError> {
        let file = self.refs_file(path);
        let content = fs::read_to_string(&file).map_err(|_| SyncError::Store {
            operation: "query references".to_string(),
            detail: format!("unknown store path {}", path),
        })?;
        let rendered: Vec<String> = serde_json::from_str(&content).map_err(|e| SyncError::Store {
            operation: "query references".to_string(),
            detail: format!("corrupt reference list for {}: {}", path, e),
        })?;
        let mut refs = Vec::with_capacity(rendered.len());
        for r in rendered {
            refs.push(StorePath::parse(&r).map_err(|e| SyncError::Store {
                operation: "query references".to_string(),
                detail: e,
            })?);
        }
        Ok(refs)
    }

    fn contains(&self, path: &StorePath) -> bool {
        // Reference sidecars are written last, so their presence marks a
        // complete install.
        self.path_dir(path).is_dir() && self.refs_file(path).is_file()
    }

    fn realize(&self, path: &StorePath) -> Result<PathBuf, SyncError> {
        let dir = self.path_dir(path);
        if !self.contains(path) {
            return Err(SyncError::Store {
                operation: "realize".to_string(),
                detail: format!("store path {} is not present", path),
            });
        }
        Ok(dir)
    }

    fn materialize(
        &self,
        path: &StorePath,
        nar_bytes: &[u8],
        references: &[StorePath],
    ) -> Result<(), SyncError> {
        if self.contains(path) {
            return Ok(());
        }

        let staging = self.tmp_dir().join(path.render());
        if staging.exists() {
            let _ = fs::remove_dir_all(&staging);
        }
        if let Err(e) = archive::decode_into(nar_bytes, &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let final_dir = self.path_dir(path);
        if let Err(e) = fs::rename(&staging, &final_dir) {
            let _ = fs::remove_dir_all(&staging);
            // A concurrent materialize of the same path may have won the
            // rename; identical content, so that is success.
            if self.contains(path) {
                return Ok(());
            }
            return Err(SyncError::io("materialize", Some(&final_dir.to_string_lossy()), e));
        }

        self.write_refs(&self.refs_file(path), references)
    }
}
