//! Run cache: fingerprint → previously submitted run id.
//!
//! Before a run is submitted, its [`RunFingerprint`] is looked up here. A hit
//! means an identical run was already submitted and its id can be reused; a
//! miss means the caller submits a new run and [`record`](RunCache::record)s
//! it afterwards.
//!
//! # Semantics
//!
//! - Entries are append-only. Once a fingerprint maps to a run id it keeps
//!   that id for the lifetime of the store.
//! - The cache is best-effort, not a lock. Two concurrent schedulers may both
//!   miss on the same fingerprint and both submit; the first
//!   [`record`](RunCache::record) wins and the second id is dropped.
//! - There is no TTL or eviction. If the backing store evicts, that's the
//!   store's business.
//!
//! # Stores
//!
//! | Store | Module | Description |
//! |-------|--------|-------------|
//! | Memory | [`memory`] | Process-local map |
//! | JSON file | [`file`] | `{dir}/.labrunner/run_cache.json` |

pub mod file;
pub mod memory;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::fingerprint::RunFingerprint;

pub use file::JsonFileCacheStore;
pub use memory::MemoryCacheStore;

/// Result type for cache store operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised by a cache store.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value persistence used by the [`RunCache`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Stores `value` under `key` unless the key is already present.
    ///
    /// Returns `true` if the value was inserted.
    async fn put_if_absent(&self, key: &str, value: &str) -> CacheResult<bool>;
}

/// Maps run fingerprints to run ids on top of a [`CacheStore`].
pub struct RunCache<C> {
    store: C,
}

impl<C: CacheStore> RunCache<C> {
    pub fn new(store: C) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    /// Returns the run id previously recorded for `fingerprint`.
    pub async fn lookup(&self, fingerprint: &RunFingerprint) -> CacheResult<Option<String>> {
        let hit = self.store.get(fingerprint.as_str()).await?;
        match &hit {
            Some(run_id) => debug!("Run cache hit for {}: {}", fingerprint, run_id),
            None => debug!("Run cache miss for {}", fingerprint),
        }
        Ok(hit)
    }

    /// Records that `fingerprint` was submitted as `run_id`.
    ///
    /// An existing mapping is never replaced; a conflicting id (from a
    /// concurrent duplicate submission) is logged and dropped.
    pub async fn record(&self, fingerprint: &RunFingerprint, run_id: &str) -> CacheResult<()> {
        let inserted = self.store.put_if_absent(fingerprint.as_str(), run_id).await?;
        if inserted {
            debug!("Recorded run {} for {}", run_id, fingerprint);
        } else if let Some(existing) = self.store.get(fingerprint.as_str()).await?
            && existing != run_id
        {
            warn!(
                "Fingerprint {} already maps to run {}; keeping it and dropping duplicate run {}",
                fingerprint, existing, run_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(seed: &str) -> RunFingerprint {
        RunFingerprint::from_hex(format!("{:0>64}", seed))
    }

    #[tokio::test]
    async fn test_lookup_miss_then_hit() {
        let cache = RunCache::new(MemoryCacheStore::default());
        let key = fingerprint("a1");

        assert!(cache.lookup(&key).await.unwrap().is_none());
        cache.record(&key, "run-1").await.unwrap();
        assert_eq!(cache.lookup(&key).await.unwrap().as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn test_record_never_replaces() {
        let cache = RunCache::new(MemoryCacheStore::default());
        let key = fingerprint("b2");

        cache.record(&key, "run-1").await.unwrap();
        cache.record(&key, "run-2").await.unwrap();
        assert_eq!(cache.lookup(&key).await.unwrap().as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn test_concurrent_distinct_fingerprints() {
        let cache = RunCache::new(MemoryCacheStore::default());
        let keys: Vec<_> = (0..16).map(|i| fingerprint(&i.to_string())).collect();
        let ids: Vec<_> = (0..16).map(|i| format!("run-{}", i)).collect();

        let results = futures::future::join_all(
            keys.iter().zip(&ids).map(|(key, id)| cache.record(key, id)),
        )
        .await;
        assert!(results.iter().all(Result::is_ok));

        for (i, key) in keys.iter().enumerate() {
            assert_eq!(
                cache.lookup(key).await.unwrap(),
                Some(format!("run-{}", i))
            );
        }
    }
}
