//! Filesystem-backed blob store.
//!
//! Stores every blob as a regular file below a root directory. This is the
//! store used by [`TestRunService::from_config`](crate::orchestrator::TestRunService::from_config)
//! and by the in-memory test lab in tests; it is also a reasonable choice when
//! the "remote" storage is a mounted bucket.
//!
//! # Example Configuration
//!
//! ```toml
//! [storage]
//! root = "~/.cache/labrunner/blobs"
//! ```

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{ArtifactReference, BlobReader, BlobStore, StorageError, StorageResult};

/// Blob store keeping blobs as files under `root`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Creates a store rooted at `root`. The directory is created lazily on
    /// the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a storage path to a file below the root.
    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(StorageError::InvalidPath(path.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> StorageResult<ArtifactReference> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let bytes = bytes.to_vec();

        debug!("Writing {} bytes to {}", bytes.len(), target.display());

        // Write through a temp file in the same directory so readers never
        // observe a partially written blob.
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&parent)?;
            let mut file = tempfile::NamedTempFile::new_in(&parent)?;
            std::io::Write::write_all(&mut file, &bytes)?;
            file.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Transport(format!("write task failed: {}", e)))??;

        Ok(ArtifactReference::new(path.trim_start_matches('/')))
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&target).await? && target.is_file())
    }

    async fn get(&self, path: &str) -> StorageResult<Vec<u8>> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let prefix = prefix.trim_matches('/');
        let base = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix)?
        };
        let root = self.root.clone();

        tokio::task::spawn_blocking(move || list_files(&root, &base))
            .await
            .map_err(|e| StorageError::Transport(format!("list task failed: {}", e)))?
    }

    async fn open_read(&self, path: &str) -> StorageResult<BlobReader> {
        let target = self.resolve(path)?;
        let opened = tokio::task::spawn_blocking(move || std::fs::File::open(target))
            .await
            .map_err(|e| StorageError::Transport(format!("open task failed: {}", e)))?;
        match opened {
            Ok(file) => Ok(Box::new(std::io::BufReader::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn download(&self, path: &str, local: &Path) -> StorageResult<()> {
        let source = self.resolve(path)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(StorageError::NotFound(path.to_string()));
        }
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, local).await?;
        Ok(())
    }
}

/// Recursively collects files below `base`, returned as `/`-separated paths
/// relative to `root`.
fn list_files(root: &Path, base: &Path) -> StorageResult<Vec<String>> {
    if !base.exists() {
        return Ok(Vec::new());
    }

    let mut found: Vec<PathBuf> = Vec::new();

    let mut pending = vec![base.to_path_buf()];
    while let Some(dir) = pending.pop() {
        if dir.is_file() {
            found.push(dir);
            continue;
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                found.push(path);
            }
        }
    }

    let mut paths: Vec<String> = found
        .iter()
        .filter_map(|p| p.strip_prefix(root).ok())
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect();
    paths.sort();
    Ok(paths)
}
