//! Blob storage abstraction for test artifacts and run results.
//!
//! Test packages are uploaded here before a run is submitted, and the remote
//! test lab writes its result bundles back under a per-invocation prefix.
//! labrunner only needs a handful of primitives from the storage backend, so
//! the [`BlobStore`] trait stays small:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        BlobStore                             │
//! │                                                              │
//! │  put(path, bytes) ─────────► ArtifactReference               │
//! │  exists(path) / get(path)                                    │
//! │  list(prefix) ─────────────► Vec<path>                       │
//! │  download(path, local)                                       │
//! │  open_read(path) ──────────► BlobReader (streaming)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Paths are `/`-separated and relative to the store root. Backends must
//! reject paths that try to escape the root (`..`, absolute paths).
//!
//! # Built-in Stores
//!
//! | Store | Module | Description |
//! |-------|--------|-------------|
//! | Local | [`local`] | Blobs as files under a root directory |

pub mod local;

use std::fmt;
use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while talking to blob storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested blob does not exist.
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// The path is empty or escapes the store root.
    #[error("Invalid blob path: {0}")]
    InvalidPath(String),

    /// Local I/O failure while reading or writing a blob.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The storage backend could not be reached or rejected the request.
    #[error("Storage transport error: {0}")]
    Transport(String),
}

/// A reference to an uploaded blob.
///
/// References are handed to the test lab when a run is submitted. Two
/// references are equal when they point at the same storage path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactReference {
    path: String,
}

impl ArtifactReference {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Storage path of the referenced blob.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// A blocking reader over a blob's contents.
///
/// Returned by [`BlobStore::open_read`] so large archives can be consumed
/// without buffering them in memory. Reads may block; drive them from a
/// blocking context when running inside an async task.
pub type BlobReader = Box<dyn Read + Send>;

/// Storage backend holding artifacts and run results.
///
/// # Thread Safety
///
/// Stores must be `Send + Sync`; a single store is shared by the artifact
/// uploader, the test lab and the result downloader.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes `bytes` to `path`, replacing any existing blob.
    async fn put(&self, path: &str, bytes: &[u8]) -> StorageResult<ArtifactReference>;

    /// Returns `true` if a blob exists at `path`.
    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// Reads a whole blob into memory.
    async fn get(&self, path: &str) -> StorageResult<Vec<u8>>;

    /// Lists every blob below `prefix`, sorted by path.
    ///
    /// An unknown prefix yields an empty list rather than an error.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Opens a streaming reader over a blob.
    async fn open_read(&self, path: &str) -> StorageResult<BlobReader>;

    /// Copies a blob to a local file, creating parent directories as needed.
    ///
    /// The default implementation buffers the blob through [`get`](Self::get).
    async fn download(&self, path: &str, local: &Path) -> StorageResult<()> {
        let bytes = self.get(path).await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, bytes).await?;
        Ok(())
    }
}

/// Joins two storage path segments with a single `/`.
pub fn join_path(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("results", "a.xml"), "results/a.xml");
        assert_eq!(join_path("results/", "/a.xml"), "results/a.xml");
        assert_eq!(join_path("", "a.xml"), "a.xml");
    }

    #[test]
    fn test_reference_equality_by_path() {
        let a = ArtifactReference::new("artifacts/abc/test.apk");
        let b = ArtifactReference::new(String::from("artifacts/abc/test.apk"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "artifacts/abc/test.apk");
        assert_ne!(a, ArtifactReference::new("artifacts/abd/test.apk"));
    }
}
