//! Configuration schema definitions for labrunner.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── LabConfig              - Test lab project and polling
//! ├── StorageConfig          - Blob store root and results prefix
//! ├── CacheConfig            - Where the run cache file lives
//! └── TrackerConfig          - Optional issue tracker access
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

/// Root configuration structure for labrunner.
///
/// # TOML Structure
///
/// ```toml
/// [lab]
/// project_id = "my-project"
/// poll_interval_secs = 10
///
/// [storage]
/// root = "~/.labrunner/blobs"
///
/// [cache]
/// dir = "."
///
/// [tracker]
/// owner = "androidx"
/// repo = "androidx"
/// token = "ghp_..."
/// ```
///
/// # Example
///
/// ```
/// use labrunner::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [lab]
///     project_id = "my-project"
///
///     [storage]
///     root = "/tmp/blobs"
/// "#).unwrap();
/// assert_eq!(config.lab.poll_interval_secs, 10);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Test lab settings.
    pub lab: LabConfig,

    /// Blob storage settings.
    pub storage: StorageConfig,

    /// Run cache settings (optional, has defaults).
    #[serde(default)]
    pub cache: CacheConfig,

    /// Issue tracker access. Only needed for tracker operations.
    #[serde(default)]
    pub tracker: Option<TrackerConfig>,
}

impl Config {
    /// Checks values serde can't: non-empty identifiers, a non-zero poll
    /// interval, and paths and tokens that expand.
    ///
    /// [`load_config`](super::load_config) calls this, so a loaded config
    /// has already passed.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.lab.project_id.trim().is_empty(),
            "lab.project_id must not be empty"
        );
        ensure!(
            self.lab.poll_interval_secs > 0,
            "lab.poll_interval_secs must be at least 1"
        );
        self.storage.root_path()?;
        if let Some(prefix) = &self.storage.results_prefix {
            let trimmed = prefix.trim_matches('/');
            if trimmed.is_empty() || trimmed.split('/').any(|s| s.is_empty() || s == "..") {
                bail!("storage.results_prefix is not a valid storage path: {:?}", prefix);
            }
        }
        self.cache.dir_path()?;
        if let Some(tracker) = &self.tracker {
            ensure!(
                !tracker.owner.is_empty() && !tracker.repo.is_empty(),
                "tracker.owner and tracker.repo must not be empty"
            );
            ensure!(
                !tracker.token_value()?.is_empty(),
                "tracker.token must not be empty"
            );
        }
        Ok(())
    }
}

/// Test lab settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `poll_interval_secs` | 10 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LabConfig {
    /// Project the lab bills runs to.
    pub project_id: String,

    /// Seconds to wait between two status polls.
    ///
    /// Default: 10
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    10
}

/// Blob storage settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root directory of the local blob store. `~` and environment
    /// variables are expanded.
    pub root: String,

    /// Prefix under which result folders are created.
    ///
    /// Should be unique per invocation. When unset, a fresh random prefix is
    /// generated for every service.
    #[serde(default)]
    pub results_prefix: Option<String>,
}

impl StorageConfig {
    /// Returns `root` with `~` and environment variables expanded.
    pub fn root_path(&self) -> Result<PathBuf> {
        expand(&self.root).context("Invalid storage root")
    }
}

/// Run cache settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `dir` | `"."` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Directory holding `.labrunner/run_cache.json`. `~` and environment
    /// variables are expanded.
    ///
    /// Default: `"."`
    #[serde(default = "default_cache_dir")]
    pub dir: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

impl CacheConfig {
    /// Returns `dir` with `~` and environment variables expanded.
    pub fn dir_path(&self) -> Result<PathBuf> {
        expand(&self.dir).context("Invalid cache directory")
    }
}

fn default_cache_dir() -> String {
    ".".to_string()
}

/// Issue tracker access.
///
/// # Example
///
/// ```toml
/// [tracker]
/// endpoint = "https://github.example.com/api/v3"
/// owner = "androidx"
/// repo = "androidx"
/// token = "${GITHUB_TOKEN}"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerConfig {
    /// API endpoint.
    ///
    /// Default: `"https://api.github.com"`
    #[serde(default = "default_tracker_endpoint")]
    pub endpoint: String,

    /// Repository owner (user or organization).
    pub owner: String,

    /// Repository name.
    pub repo: String,

    /// Access token sent with every request. `~` and environment variables
    /// are expanded, so `"${GITHUB_TOKEN}"` keeps the secret out of the file.
    pub token: String,
}

impl TrackerConfig {
    /// Returns `token` with `~` and environment variables expanded.
    pub fn token_value(&self) -> Result<String> {
        let expanded = shellexpand::full(&self.token).context("Invalid tracker token")?;
        Ok(expanded.into_owned())
    }
}

fn default_tracker_endpoint() -> String {
    "https://api.github.com".to_string()
}

fn expand(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path)
        .with_context(|| format!("Failed to expand path: {}", path))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
