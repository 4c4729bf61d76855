//! Fetching result files of finished runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::poller::CompletedRuns;
use crate::error::Result;
use crate::storage::{BlobStore, StorageError, StorageResult};

/// Local files downloaded for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedArtifact {
    pub run_id: String,
    /// Downloaded files, sorted.
    pub files: Vec<PathBuf>,
}

/// A run whose results could not be downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadFailure {
    pub run_id: String,
    pub message: String,
}

/// Result of a download pass.
///
/// Failures of individual runs don't abort the pass; they are listed in
/// `failures` next to the runs that did download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub downloads: Vec<DownloadedArtifact>,
    pub failures: Vec<DownloadFailure>,
}

impl DownloadReport {
    /// Files downloaded for `run_id`. `None` if the run had no output.
    pub fn files_for(&self, run_id: &str) -> Option<&[PathBuf]> {
        self.downloads
            .iter()
            .find(|d| d.run_id == run_id)
            .map(|d| d.files.as_slice())
    }

    pub fn failure_for(&self, run_id: &str) -> Option<&DownloadFailure> {
        self.failures.iter().find(|f| f.run_id == run_id)
    }

    /// Returns `true` if no run failed to download.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Copies result files from the blob store into a local folder.
pub struct ResultDownloader<B: ?Sized> {
    blob: Arc<B>,
}

impl<B: BlobStore + ?Sized> ResultDownloader<B> {
    pub fn new(blob: Arc<B>) -> Self {
        Self { blob }
    }

    /// Downloads the results of every run in `results`.
    ///
    /// `output_folder` is cleared first. Each run's files land in
    /// `output_folder/{escaped run id}/`, keeping their path relative to the
    /// run's results location. A location naming a single blob yields that
    /// blob under its file name.
    ///
    /// # Errors
    ///
    /// Only failing to clear or create `output_folder` is an error; per-run
    /// failures end up in [`DownloadReport::failures`].
    pub async fn download(
        &self,
        output_folder: &Path,
        results: &CompletedRuns,
    ) -> Result<DownloadReport> {
        // Clear output directory to avoid stale results
        if tokio::fs::try_exists(output_folder).await? {
            tokio::fs::remove_dir_all(output_folder).await?;
        }
        tokio::fs::create_dir_all(output_folder).await?;

        let mut report = DownloadReport::default();

        for run in results.iter() {
            let (Some(run_id), Some(location)) = (run.id(), run.results_location.as_deref())
            else {
                continue;
            };

            let run_folder = output_folder.join(run_dir_name(run_id));
            match self.download_run(location, &run_folder).await {
                Ok(files) if files.is_empty() => {
                    debug!("Run {} has no result files under {}", run_id, location);
                }
                Ok(files) => {
                    debug!("Downloaded {} files for run {}", files.len(), run_id);
                    report.downloads.push(DownloadedArtifact {
                        run_id: run_id.to_string(),
                        files,
                    });
                }
                Err(e) => {
                    warn!("Failed to download results of run {}: {}", run_id, e);
                    report.failures.push(DownloadFailure {
                        run_id: run_id.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Downloaded results of {} runs into {} ({} failed)",
            report.downloads.len(),
            output_folder.display(),
            report.failures.len()
        );
        Ok(report)
    }

    async fn download_run(&self, location: &str, run_folder: &Path) -> StorageResult<Vec<PathBuf>> {
        let prefix = location.trim_matches('/');
        let mut files = Vec::new();

        for blob_path in self.blob.list(prefix).await? {
            let relative = match blob_path.strip_prefix(prefix) {
                Some("") => blob_path.rsplit('/').next().unwrap_or(&blob_path),
                Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
                _ => {
                    debug!("Skipping {}, not below {}", blob_path, prefix);
                    continue;
                }
            };
            let local = local_path(run_folder, relative)?;
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.blob.download(&blob_path, &local).await?;
            files.push(local);
        }

        files.sort();
        Ok(files)
    }
}

fn local_path(run_folder: &Path, relative: &str) -> StorageResult<PathBuf> {
    let mut path = run_folder.to_path_buf();
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(StorageError::InvalidPath(relative.to_string()));
        }
        path.push(segment);
    }
    if path == run_folder {
        return Err(StorageError::InvalidPath(relative.to_string()));
    }
    Ok(path)
}

/// Makes a run id safe to use as a single directory name.
///
/// `[A-Za-z0-9.-]` are kept, except a leading `.`. Every other byte,
/// including `_`, becomes `_` followed by two lowercase hex digits, so
/// distinct ids never share a directory.
fn run_dir_name(run_id: &str) -> String {
    if run_id.is_empty() {
        return "_".to_string();
    }
    let mut name = String::with_capacity(run_id.len());
    for (i, byte) in run_id.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && i > 0);
        if keep {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("_{:02x}", byte));
        }
    }
    name
}
