//! Prefix-scoped views onto the barrier.
//!
//! A [`BarrierView`] transparently prepends a storage prefix to every
//! operation, giving each mounted backend (and each manager) an isolated
//! sub-namespace. Backends receive only their view and therefore cannot
//! address storage outside their mount.

use std::fmt;
use std::sync::Arc;

use crate::barrier::Barrier;
use crate::error::BarrierError;

/// A path-prefixed façade over the barrier.
pub struct BarrierView {
    barrier: Arc<Barrier>,
    prefix: String,
}

impl BarrierView {
    /// Create a view rooted at `prefix`. The prefix must end with `/`.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { barrier, prefix }
    }

    /// The storage prefix this view is rooted at.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Read a value relative to the view prefix.
    ///
    /// # Errors
    ///
    /// Propagates [`BarrierError`] from the underlying barrier.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        self.barrier.get(&self.expand(key)).await
    }

    /// Write a value relative to the view prefix.
    ///
    /// # Errors
    ///
    /// Propagates [`BarrierError`] from the underlying barrier.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        self.barrier.put(&self.expand(key), value).await
    }

    /// Delete a key relative to the view prefix.
    ///
    /// # Errors
    ///
    /// Propagates [`BarrierError`] from the underlying barrier.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        self.barrier.delete(&self.expand(key)).await
    }

    /// List keys under the view, returned relative to the view prefix.
    ///
    /// # Errors
    ///
    /// Propagates [`BarrierError`] from the underlying barrier.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        let keys = self.barrier.list(&self.expand(prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(String::from))
            .collect())
    }

    fn expand(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl fmt::Debug for BarrierView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrierView")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use coffer_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::barrier::Barrier;

    async fn unsealed_barrier() -> Arc<Barrier> {
        let physical = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(physical as Arc<dyn StorageBackend>));
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();
        barrier
    }

    #[tokio::test]
    async fn view_prepends_prefix() {
        let barrier = unsealed_barrier().await;
        let view = BarrierView::new(Arc::clone(&barrier), "logical/abc/");

        view.put("foo", b"bar").await.unwrap();
        assert_eq!(
            barrier.get("logical/abc/foo").await.unwrap(),
            Some(b"bar".to_vec())
        );
        assert_eq!(view.get("foo").await.unwrap(), Some(b"bar".to_vec()));
    }

    #[tokio::test]
    async fn missing_trailing_slash_is_added() {
        let barrier = unsealed_barrier().await;
        let view = BarrierView::new(barrier, "auth/xyz");
        assert_eq!(view.prefix(), "auth/xyz/");
    }

    #[tokio::test]
    async fn list_strips_prefix() {
        let barrier = unsealed_barrier().await;
        let view = BarrierView::new(Arc::clone(&barrier), "sys/expire/");

        view.put("secret/foo/1", b"a").await.unwrap();
        view.put("secret/foo/2", b"b").await.unwrap();
        barrier.put("other/key", b"c").await.unwrap();

        let keys = view.list("secret/").await.unwrap();
        assert_eq!(keys, vec!["secret/foo/1", "secret/foo/2"]);
    }

    #[tokio::test]
    async fn views_are_isolated() {
        let barrier = unsealed_barrier().await;
        let view_a = BarrierView::new(Arc::clone(&barrier), "logical/a/");
        let view_b = BarrierView::new(Arc::clone(&barrier), "logical/b/");

        view_a.put("key", b"a").await.unwrap();
        assert_eq!(view_b.get("key").await.unwrap(), None);

        view_b.delete("key").await.unwrap();
        assert_eq!(view_a.get("key").await.unwrap(), Some(b"a".to_vec()));
    }
}
