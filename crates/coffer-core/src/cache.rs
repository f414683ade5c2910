//! Read-through cache over the physical backend.
//!
//! The physical store may be remote and slow; the cache keeps recently
//! read values in memory. It is invalidated entry-by-entry on writes and
//! deletes, and purged wholesale at every seal/unseal transition so a node
//! never serves values from a previous epoch. Listing always passes
//! through — prefix results cannot be invalidated precisely.

use std::sync::Arc;

use coffer_storage::{HaBackend, StorageBackend, StorageError};
use moka::sync::Cache;

/// Default maximum number of cached entries.
pub const DEFAULT_CACHE_SIZE: u64 = 32 * 1024;

/// A caching wrapper around a physical backend.
pub struct PhysicalCache {
    inner: Arc<dyn StorageBackend>,
    cache: Cache<String, Arc<Vec<u8>>>,
}

impl PhysicalCache {
    /// Wrap `inner` with a cache of `size` entries (0 means default).
    #[must_use]
    pub fn new(inner: Arc<dyn StorageBackend>, size: u64) -> Self {
        let capacity = if size == 0 { DEFAULT_CACHE_SIZE } else { size };
        Self {
            inner,
            cache: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Drop every cached entry.
    pub fn purge(&self) {
        self.cache.invalidate_all();
    }
}

#[async_trait::async_trait]
impl StorageBackend for PhysicalCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value.as_ref().clone()));
        }

        let value = self.inner.get(key).await?;
        if let Some(value) = &value {
            self.cache.insert(key.to_owned(), Arc::new(value.clone()));
        }
        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.inner.put(key, value).await?;
        self.cache.insert(key.to_owned(), Arc::new(value.to_vec()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await?;
        self.cache.invalidate(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }

    fn ha(&self) -> Option<&dyn HaBackend> {
        self.inner.ha()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use coffer_storage::MemoryBackend;

    use super::*;

    fn make_cache() -> (Arc<MemoryBackend>, PhysicalCache) {
        let inner = Arc::new(MemoryBackend::new());
        let cache = PhysicalCache::new(Arc::clone(&inner) as Arc<dyn StorageBackend>, 0);
        (inner, cache)
    }

    #[tokio::test]
    async fn reads_are_served_from_cache() {
        let (inner, cache) = make_cache();
        cache.put("k", b"v1").await.unwrap();

        // Mutate the backing store behind the cache's back.
        inner.put("k", b"v2").await.unwrap();

        // The cached value wins until invalidated.
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn purge_drops_stale_entries() {
        let (inner, cache) = make_cache();
        cache.put("k", b"v1").await.unwrap();
        inner.put("k", b"v2").await.unwrap();

        cache.purge();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn delete_invalidates_entry() {
        let (_inner, cache) = make_cache();
        cache.put("k", b"v").await.unwrap();
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn miss_falls_through_and_populates() {
        let (inner, cache) = make_cache();
        inner.put("k", b"v").await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));

        // Now cached: removing from the inner store does not affect reads.
        inner.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn list_passes_through() {
        let (inner, cache) = make_cache();
        cache.put("a/1", b"x").await.unwrap();
        inner.put("a/2", b"y").await.unwrap();

        let keys = cache.list("a/").await.unwrap();
        assert_eq!(keys, vec!["a/1", "a/2"]);
    }

    #[tokio::test]
    async fn ha_capability_is_delegated() {
        let (_inner, cache) = make_cache();
        assert!(cache.ha().is_none());

        let ha_inner = Arc::new(coffer_storage::MemoryHaBackend::new());
        let ha_cache = PhysicalCache::new(ha_inner as Arc<dyn StorageBackend>, 0);
        assert!(ha_cache.ha().is_some());
    }
}
