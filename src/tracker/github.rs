//! GitHub REST API client.
//!
//! Talks to `{endpoint}/repos/{owner}/{repo}/...` with the v3 media type and
//! token authentication. Calls time out after ten minutes; artifact archives
//! can be large, so they are streamed to a temporary file instead of memory.
//!
//! # Example Configuration
//!
//! ```toml
//! [tracker]
//! endpoint = "https://api.github.com"
//! owner = "androidx"
//! repo = "androidx"
//! token = "${GITHUB_TOKEN}"
//! ```

use std::io::{BufReader, SeekFrom};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::{Artifact, Comment, IssueTracker, Label, RunInfo, TrackerError, TrackerResult};
use crate::config::TrackerConfig;
use crate::storage::BlobReader;

const USER_AGENT_VALUE: &str = concat!("labrunner/", env!("CARGO_PKG_VERSION"));

const GITHUB_MEDIA_TYPE: &str = "application/vnd.github.v3+json";

const CALL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Deserialize)]
struct ArtifactsResponse {
    artifacts: Vec<Artifact>,
}

#[derive(Debug, Serialize)]
struct NewComment<'a> {
    body: &'a str,
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TrackerError::Decode(e.to_string())
        } else {
            TrackerError::Transport(e.to_string())
        }
    }
}

/// [`IssueTracker`] backed by the GitHub API.
#[derive(Debug, Clone)]
pub struct GithubClient {
    client: reqwest::Client,
    base_url: Url,
}

impl GithubClient {
    /// Creates a client for the repository named in `config`.
    ///
    /// # Errors
    ///
    /// Returns `TrackerError::Transport` if the endpoint is not a valid URL,
    /// or the token doesn't expand or can't be sent as a header.
    pub fn new(config: &TrackerConfig) -> TrackerResult<Self> {
        let token = config
            .token_value()
            .map_err(|e| TrackerError::Transport(format!("{:#}", e)))?;
        let mut authorization = HeaderValue::from_str(&format!("token {}", token))
            .map_err(|e| TrackerError::Transport(format!("invalid token: {}", e)))?;
        authorization.set_sensitive(true);

        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_MEDIA_TYPE));
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        default_headers.insert(AUTHORIZATION, authorization);

        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .default_headers(default_headers)
            .build()
            .map_err(|e| TrackerError::Transport(format!("failed to create HTTP client: {}", e)))?;

        let base_url = format!(
            "{}/repos/{}/{}/",
            config.endpoint.trim_end_matches('/'),
            config.owner,
            config.repo
        );
        let base_url = Url::parse(&base_url)
            .map_err(|e| TrackerError::Transport(format!("invalid endpoint {}: {}", base_url, e)))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Builds a URL below the repository, percent-encoding each segment.
    fn url(&self, segments: &[&str]) -> TrackerResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TrackerError::Transport(format!("invalid base URL {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!(method = %method, url = %url, "github request");
        self.client.request(method, url)
    }

    async fn send(&self, request: RequestBuilder) -> TrackerResult<Response> {
        let response = request.send().await?;
        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "github response");

        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TrackerError::NotFound(response.url().to_string()));
        }
        let message = response.text().await.unwrap_or_default();
        Err(TrackerError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> TrackerResult<T> {
        let response = self.send(request).await?;
        response
            .json()
            .await
            .map_err(|e| TrackerError::Decode(e.to_string()))
    }
}

#[async_trait]
impl IssueTracker for GithubClient {
    async fn add_labels(&self, issue: &str, labels: &[String]) -> TrackerResult<Vec<Label>> {
        let url = self.url(&["issues", issue, "labels"])?;
        self.json(self.request(Method::POST, url).json(labels)).await
    }

    async fn delete_label(&self, issue: &str, label: &str) -> TrackerResult<()> {
        let url = self.url(&["issues", issue, "labels", label])?;
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn list_labels(&self, issue: &str) -> TrackerResult<Vec<Label>> {
        let url = self.url(&["issues", issue, "labels"])?;
        self.json(self.request(Method::GET, url)).await
    }

    async fn comment(&self, issue: &str, body: &str) -> TrackerResult<Comment> {
        let url = self.url(&["issues", issue, "comments"])?;
        self.json(self.request(Method::POST, url).json(&NewComment { body }))
            .await
    }

    async fn run_info(&self, run_id: &str) -> TrackerResult<RunInfo> {
        let url = self.url(&["actions", "runs", run_id])?;
        self.json(self.request(Method::GET, url)).await
    }

    async fn artifacts(&self, run_id: &str) -> TrackerResult<Vec<Artifact>> {
        let url = self.url(&["actions", "runs", run_id, "artifacts"])?;
        let response: ArtifactsResponse = self.json(self.request(Method::GET, url)).await?;
        Ok(response.artifacts)
    }

    async fn download_archive(&self, url: &str) -> TrackerResult<BlobReader> {
        let url = Url::parse(url)
            .or_else(|_| self.base_url.join(url))
            .map_err(|e| TrackerError::Transport(format!("invalid archive URL {}: {}", url, e)))?;
        let mut response = self.send(self.request(Method::GET, url)).await?;

        let spool = tokio::task::spawn_blocking(tempfile::tempfile)
            .await
            .map_err(|e| TrackerError::Transport(format!("spool task failed: {}", e)))?
            .map_err(spool_error)?;
        let mut spool = tokio::fs::File::from_std(spool);

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            spool.write_all(&chunk).await.map_err(spool_error)?;
            written += chunk.len() as u64;
        }
        spool.flush().await.map_err(spool_error)?;
        spool.seek(SeekFrom::Start(0)).await.map_err(spool_error)?;
        debug!(bytes = written, "downloaded archive");

        Ok(Box::new(BufReader::new(spool.into_std().await)))
    }
}

fn spool_error(e: std::io::Error) -> TrackerError {
    TrackerError::Transport(format!("failed to spool archive: {}", e))
}
