//! Content-addressed storage for checkpoint file backups.
//!
//! A [`BlobRef`] is the BLAKE3 hex digest of the bytes it names, so storing
//! the same content twice is a no-op and any backend can verify what it
//! hands back.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Reference to stored bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    /// Reference for `bytes`.
    pub fn for_content(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// Hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_well_formed(&self) -> bool {
        self.0.len() == 64 && self.0.chars().all(|c| c.is_ascii_hexdigit())
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque put/get store.
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return their reference.
    fn put(&self, bytes: &[u8]) -> Result<BlobRef>;

    /// Fetch the bytes behind `blob`.
    fn get(&self, blob: &BlobRef) -> Result<Vec<u8>>;
}

/// Blobs held in memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<BlobRef, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs.
    pub fn len(&self) -> usize {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<BlobRef> {
        let blob = BlobRef::for_content(bytes);
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(blob.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(blob)
    }

    fn get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(blob)
            .cloned()
            .ok_or_else(|| Error::Blob(format!("blob {blob} not found")))
    }
}

/// Blobs stored as files named by their digest.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Store rooted at `root`, created if missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        log::debug!("Opened blob store at {}", root.display());
        Ok(Self { root })
    }

    /// Directory holding the blobs.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, blob: &BlobRef) -> Result<PathBuf> {
        if !blob.is_well_formed() {
            return Err(Error::Blob(format!("malformed blob reference {blob:?}")));
        }
        Ok(self.root.join(&blob.0[..2]).join(&blob.0))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<BlobRef> {
        let blob = BlobRef::for_content(bytes);
        let path = self.path_for(&blob)?;
        if path.exists() {
            return Ok(blob);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(blob)
    }

    fn get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        let path = self.path_for(blob)?;
        let bytes = fs::read(&path)
            .map_err(|e| Error::Blob(format!("cannot read {}: {e}", path.display())))?;
        if BlobRef::for_content(&bytes) != *blob {
            return Err(Error::Blob(format!("blob {blob} is corrupt")));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_dedupes() {
        let store = MemoryBlobStore::new();
        let a = store.put(b"[Service]\n").unwrap();
        let b = store.put(b"[Service]\n").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).unwrap(), b"[Service]\n");
    }

    #[test]
    fn test_memory_store_missing_blob() {
        let store = MemoryBlobStore::new();
        let missing = BlobRef::for_content(b"nothing");
        assert!(matches!(store.get(&missing), Err(Error::Blob(_))));
    }

    #[test]
    fn test_fs_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let blob = FsBlobStore::open(dir.path()).unwrap().put(b"unit").unwrap();

        let reopened = FsBlobStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(&blob).unwrap(), b"unit");
        assert!(reopened.root().join(&blob.as_str()[..2]).is_dir());
    }

    #[test]
    fn test_fs_store_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        let blob = store.put(b"original").unwrap();
        let path = dir.path().join(&blob.as_str()[..2]).join(blob.as_str());
        fs::write(&path, b"tampered").unwrap();
        assert!(store.get(&blob).is_err());
    }

    #[test]
    fn test_fs_store_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        let evil: BlobRef = serde_json::from_str("\"../../etc/passwd\"").unwrap();
        assert!(store.get(&evil).is_err());
    }
}
