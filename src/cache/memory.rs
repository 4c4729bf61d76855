//! Process-local cache store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CacheResult, CacheStore};

/// In-memory [`CacheStore`]; entries live as long as the store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drops every entry, as if the backing store had been wiped.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> CacheResult<bool> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_if_absent() {
        let store = MemoryCacheStore::new();
        assert!(store.put_if_absent("k", "v1").await.unwrap());
        assert!(!store.put_if_absent("k", "v2").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryCacheStore::new();
        store.put_if_absent("k", "v").await.unwrap();
        store.clear().await;
        assert!(store.is_empty().await);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
