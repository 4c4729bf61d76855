//! JSON-file cache store.
//!
//! Persists the run cache in `{cache_dir}/.labrunner/run_cache.json` so repeated
//! invocations on the same machine can reuse runs submitted earlier.
//!
//! # File Format
//!
//! ```json
//! {
//!   "3f1c…e9": { "run_id": "matrix-12ab", "created_at": "2024-01-01T00:00:00+00:00" }
//! }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{CacheResult, CacheStore};

/// A cached run as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCacheEntry {
    /// The run id the fingerprint was submitted as.
    pub run_id: String,

    /// RFC 3339 timestamp when the entry was recorded.
    pub created_at: String,
}

/// [`CacheStore`] persisted as a JSON file.
///
/// The whole map is held in memory and rewritten on every insert; the cache
/// only grows by one entry per newly submitted run, so this stays small.
#[derive(Debug)]
pub struct JsonFileCacheStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, RunCacheEntry>>,
}

impl JsonFileCacheStore {
    /// Loads the cache from `{cache_dir}/.labrunner/run_cache.json`.
    ///
    /// If the file doesn't exist or is invalid, starts with an empty cache.
    pub fn load(cache_dir: &Path) -> Self {
        let path = cache_dir.join(".labrunner").join("run_cache.json");

        tracing::debug!("Loading run cache from: {}", path.display());

        let entries = if !path.exists() {
            tracing::debug!("Cache file does not exist, starting with empty cache");
            HashMap::new()
        } else {
            match fs::read_to_string(&path) {
                Ok(contents) => {
                    match serde_json::from_str::<HashMap<String, RunCacheEntry>>(&contents) {
                        Ok(entries) => {
                            tracing::debug!("Loaded {} cache entries", entries.len());
                            entries
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Failed to parse cache file, starting with empty cache: {}",
                                e
                            );
                            HashMap::new()
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to read cache file, starting with empty cache: {}", e);
                    HashMap::new()
                }
            }
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Location of the backing JSON file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a snapshot of the entry stored under `key`.
    pub async fn entry(&self, key: &str) -> Option<RunCacheEntry> {
        self.entries.lock().await.get(key).cloned()
    }

    async fn save(&self, entries: &HashMap<String, RunCacheEntry>) -> CacheResult<()> {
        let contents = serde_json::to_string_pretty(entries)?;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.path, contents).await?;
        tracing::debug!("Saved {} cache entries", entries.len());
        Ok(())
    }
}

#[async_trait]
impl CacheStore for JsonFileCacheStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self
            .entries
            .lock()
            .await
            .get(key)
            .map(|entry| entry.run_id.clone()))
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> CacheResult<bool> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            RunCacheEntry {
                run_id: value.to_string(),
                created_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        if let Err(e) = self.save(&entries).await {
            // Keep memory and disk consistent: an entry that wasn't persisted
            // is not recorded.
            entries.remove(key);
            return Err(e);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_empty_cache_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileCacheStore::load(temp_dir.path());

        assert!(store.get("anything").await.unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_cache_save_and_load() {
        let temp_dir = TempDir::new().unwrap();

        let store = JsonFileCacheStore::load(temp_dir.path());
        assert!(store.put_if_absent("fp-1", "run-1").await.unwrap());

        let reloaded = JsonFileCacheStore::load(temp_dir.path());
        assert_eq!(reloaded.get("fp-1").await.unwrap().as_deref(), Some("run-1"));
        let entry = reloaded.entry("fp-1").await.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&entry.created_at).is_ok());
    }

    #[tokio::test]
    async fn test_existing_entry_is_kept() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileCacheStore::load(temp_dir.path());

        assert!(store.put_if_absent("fp-1", "run-1").await.unwrap());
        assert!(!store.put_if_absent("fp-1", "run-2").await.unwrap());

        let reloaded = JsonFileCacheStore::load(temp_dir.path());
        assert_eq!(reloaded.get("fp-1").await.unwrap().as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn test_cache_corrupted_json() {
        let temp_dir = TempDir::new().unwrap();
        let cache_dir = temp_dir.path().join(".labrunner");
        fs::create_dir_all(&cache_dir).unwrap();
        fs::write(cache_dir.join("run_cache.json"), "{ invalid json }").unwrap();

        // Should return empty cache instead of failing
        let store = JsonFileCacheStore::load(temp_dir.path());
        assert!(store.get("fp-1").await.unwrap().is_none());

        // And a write replaces the corrupt file with a valid one
        store.put_if_absent("fp-1", "run-1").await.unwrap();
        let reloaded = JsonFileCacheStore::load(temp_dir.path());
        assert_eq!(reloaded.get("fp-1").await.unwrap().as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn test_concurrent_inserts_all_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileCacheStore::load(temp_dir.path());

        let keys: Vec<String> = (0..8).map(|i| format!("fp-{}", i)).collect();
        let inserted = futures::future::join_all(
            keys.iter().map(|key| store.put_if_absent(key, "run")),
        )
        .await;
        assert!(inserted.into_iter().all(|r| r.unwrap()));

        let reloaded = JsonFileCacheStore::load(temp_dir.path());
        for key in &keys {
            assert!(reloaded.get(key).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_failed_save_is_not_recorded() {
        let temp_dir = TempDir::new().unwrap();
        // A file where the cache directory should be makes every save fail
        fs::write(temp_dir.path().join(".labrunner"), "not a dir").unwrap();
        let store = JsonFileCacheStore::load(temp_dir.path());

        assert!(store.put_if_absent("fp-1", "run-1").await.is_err());
        assert!(store.get("fp-1").await.unwrap().is_none());
    }
}
