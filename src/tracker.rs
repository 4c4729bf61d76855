//! Issue tracker and CI integration.
//!
//! After a run, results are usually reported back to where the change came
//! from: labels on the pull request, a summary comment, and artifacts of the
//! CI workflow that produced the packages. [`IssueTracker`] covers the few
//! operations this needs; [`github::GithubClient`] implements it over the
//! GitHub REST API.

pub mod github;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archive::ArchiveStream;
use crate::storage::BlobReader;

/// Result type for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Tracker transport error: {0}")]
    Transport(String),

    #[error("Failed to decode tracker response: {0}")]
    Decode(String),
}

/// A label attached to an issue or pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

/// A comment on an issue or pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub id: Option<u64>,
    pub body: String,
}

/// A CI workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    pub head_sha: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
}

/// A build artifact produced by a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub size_in_bytes: u64,
    pub archive_download_url: String,
}

/// Issue tracker / CI system.
///
/// Issues are addressed by number as a string, runs by id.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Adds `labels` to an issue and returns its labels afterwards.
    async fn add_labels(&self, issue: &str, labels: &[String]) -> TrackerResult<Vec<Label>>;

    /// Removes one label. Fails with `TrackerError::NotFound` if the issue
    /// doesn't carry it; see [`try_delete_label`] for the lenient form.
    async fn delete_label(&self, issue: &str, label: &str) -> TrackerResult<()>;

    async fn list_labels(&self, issue: &str) -> TrackerResult<Vec<Label>>;

    async fn comment(&self, issue: &str, body: &str) -> TrackerResult<Comment>;

    async fn run_info(&self, run_id: &str) -> TrackerResult<RunInfo>;

    /// Lists the artifacts of a workflow run.
    async fn artifacts(&self, run_id: &str) -> TrackerResult<Vec<Artifact>>;

    /// Opens the zip archive behind an artifact's download URL.
    async fn download_archive(&self, url: &str) -> TrackerResult<BlobReader>;
}

/// Removes `label` from `issue`, treating an absent label as success.
pub async fn try_delete_label<T: IssueTracker + ?Sized>(
    tracker: &T,
    issue: &str,
    label: &str,
) -> TrackerResult<()> {
    match tracker.delete_label(issue, label).await {
        Err(TrackerError::NotFound(_)) => {
            debug!("Issue {} has no label {}, nothing to delete", issue, label);
            Ok(())
        }
        other => other,
    }
}

/// Downloads an artifact and opens it as a lazily read zip archive.
pub async fn open_artifact<T: IssueTracker + ?Sized>(
    tracker: &T,
    artifact: &Artifact,
) -> TrackerResult<ArchiveStream<BlobReader>> {
    debug!("Opening artifact {} ({})", artifact.name, artifact.id);
    let reader = tracker.download_archive(&artifact.archive_download_url).await?;
    Ok(ArchiveStream::zip(reader))
}
