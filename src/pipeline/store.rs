//! Content-addressed object store seam.
//!
//! The engine only ever says "put these bytes, give me a hash" and "give
//! me the bytes for this hash". Large binary stage outputs go here; lock
//! records carry the hash only. The real remote sync machinery lives
//! behind this trait.

use super::error::{PipelineError, Result};
use super::fingerprint;
use std::path::PathBuf;

/// Put/get objects by content hash.
pub trait ObjectStore: Send + Sync {
    /// Store bytes, returning their `blake3:` address.
    fn put(&self, bytes: &[u8]) -> Result<String>;

    /// Fetch bytes by address.
    fn get(&self, hash: &str) -> Result<Option<Vec<u8>>>;

    /// Cheap existence check.
    fn contains(&self, hash: &str) -> bool;
}

/// Filesystem object store with a two-character fan-out, e.g.
/// `objects/ab/cdef…`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, hash: &str) -> Option<PathBuf> {
        let hex = hash.strip_prefix(fingerprint::PREFIX)?;
        if hex.len() < 3 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.root.join(&hex[..2]).join(&hex[2..]))
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, bytes: &[u8]) -> Result<String> {
        let hash = fingerprint::fingerprint_bytes(bytes);
        let path = self
            .object_path(&hash)
            .ok_or_else(|| PipelineError::Lock(format!("malformed object address '{}'", hash)))?;
        if path.exists() {
            return Ok(hash);
        }
        let parent = path.parent().expect("fan-out parent");
        std::fs::create_dir_all(parent)?;
        let temp = parent.join(format!(
            ".{}.tmp",
            path.file_name().unwrap_or_default().to_string_lossy()
        ));
        std::fs::write(&temp, bytes)?;
        std::fs::rename(&temp, &path)?;
        Ok(hash)
    }

    fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.object_path(hash) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(&path)?))
    }

    fn contains(&self, hash: &str) -> bool {
        self.object_path(hash).map(|p| p.exists()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());

        let hash = store.put(b"serialized dataframe").unwrap();
        assert!(hash.starts_with("blake3:"));
        assert!(store.contains(&hash));
        assert_eq!(store.get(&hash).unwrap().unwrap(), b"serialized dataframe");
    }

    #[test]
    fn test_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());

        let h1 = store.put(b"same bytes").unwrap();
        let h2 = store.put(b"same bytes").unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_get_unknown_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());
        let missing = format!("blake3:{}", "ab".repeat(32));
        assert!(store.get(&missing).unwrap().is_none());
        assert!(!store.contains(&missing));
        assert!(store.get("not-an-address").unwrap().is_none());
    }
}
