//! Content-addressed uploads of test artifacts.
//!
//! Every artifact lands at `artifacts/{hash}/{name}`, where `hash` is the
//! SHA-256 of the artifact bytes combined with its name. Uploading the same
//! file twice therefore resolves to the same [`ArtifactReference`], which is
//! what lets the run cache recognise repeated submissions. Blobs that already
//! exist are not transferred again.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::storage::{ArtifactReference, BlobStore, StorageError, StorageResult, join_path};

/// Storage prefix for uploaded artifacts.
const ARTIFACT_PREFIX: &str = "artifacts";

/// Fixed location of the stub used when no app-under-test is supplied.
pub const PLACEHOLDER_PATH: &str = "artifacts/placeholder/placeholder.apk";

/// Stub content uploaded to [`PLACEHOLDER_PATH`] the first time it is needed.
const PLACEHOLDER_BYTES: &[u8] = b"labrunner placeholder artifact\n";

/// Uploads test and app packages to blob storage.
pub struct ArtifactStore<B> {
    blob: std::sync::Arc<B>,
    placeholder: OnceCell<ArtifactReference>,
}

impl<B: BlobStore> ArtifactStore<B> {
    pub fn new(blob: std::sync::Arc<B>) -> Self {
        Self {
            blob,
            placeholder: OnceCell::new(),
        }
    }

    /// Uploads `bytes` under `name` and returns its stable reference.
    ///
    /// Identical `(name, bytes)` pairs always map to the same reference. If
    /// the blob is already present the transfer is skipped.
    ///
    /// # Errors
    ///
    /// Propagates any [`StorageError`] from the backend.
    pub async fn upload(&self, name: &str, bytes: &[u8]) -> StorageResult<ArtifactReference> {
        let path = artifact_path(name, bytes)?;

        if self.blob.exists(&path).await? {
            debug!("Artifact {} already uploaded, skipping transfer", path);
            return Ok(ArtifactReference::new(path));
        }

        info!("Uploading artifact {} ({} bytes)", path, bytes.len());
        self.blob.put(&path, bytes).await
    }

    /// Reads a local file and uploads it under its file name.
    pub async fn upload_file(&self, file: &Path) -> StorageResult<ArtifactReference> {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::InvalidPath(file.display().to_string()))?;
        let bytes = tokio::fs::read(file).await?;
        self.upload(&name, &bytes).await
    }

    /// Returns the reference used in place of a missing app-under-test.
    ///
    /// The stub is uploaded once per store if the backend doesn't have it yet.
    pub async fn placeholder(&self) -> StorageResult<ArtifactReference> {
        let reference = self
            .placeholder
            .get_or_try_init(|| async {
                if self.blob.exists(PLACEHOLDER_PATH).await? {
                    return Ok(ArtifactReference::new(PLACEHOLDER_PATH));
                }
                debug!("Uploading placeholder artifact to {}", PLACEHOLDER_PATH);
                self.blob.put(PLACEHOLDER_PATH, PLACEHOLDER_BYTES).await
            })
            .await?;
        Ok(reference.clone())
    }
}

/// Computes the content-addressed storage path for an artifact.
fn artifact_path(name: &str, bytes: &[u8]) -> StorageResult<String> {
    if name.is_empty() || name.contains('/') || name == ".." || name == "." {
        return Err(StorageError::InvalidPath(name.to_string()));
    }

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    Ok(join_path(&join_path(ARTIFACT_PREFIX, &digest), name))
}
