//! Configuration loading and schema definitions for labrunner.
//!
//! This module provides types and functions for loading labrunner
//! configuration from TOML files or strings. The schema covers the test lab,
//! blob storage, the run cache and the optional issue tracker.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads labrunner configuration from a TOML file.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Errors
///
/// Returns an error if the file can't be read, isn't valid TOML for the
/// schema, or fails [`Config::validate`] (for example a storage root or
/// tracker token referencing an unset environment variable).
///
/// # Example
///
/// ```no_run
/// use labrunner::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("labrunner.toml"))?;
/// println!("Polling every {}s", config.lab.poll_interval_secs);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads labrunner configuration from a TOML string.
///
/// # Example
///
/// ```
/// use labrunner::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [lab]
///     project_id = "my-project"
///     poll_interval_secs = 30
///
///     [storage]
///     root = "/tmp/blobs"
/// "#)?;
///
/// assert_eq!(config.lab.poll_interval_secs, 30);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.validate().context("Invalid config")?;

    Ok(config)
}
