//! Physical storage abstraction for Coffer.
//!
//! This crate defines the [`StorageBackend`] trait — a pure key-value
//! interface that knows nothing about secrets or encryption. The security
//! barrier in `coffer-core` wraps a storage backend so that this layer only
//! ever sees ciphertext; the backend is treated as untrusted.
//!
//! Backends may additionally offer a highly-available coordination
//! capability: an advisory lock used for single-leader election. The
//! capability is queried explicitly via [`StorageBackend::ha`] rather than
//! being part of the base contract, so plain backends stay plain.

mod error;
mod memory;
mod memory_ha;

pub use error::StorageError;
pub use memory::MemoryBackend;
pub use memory_ha::MemoryHaBackend;

use tokio::sync::{oneshot, watch};

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `core/seal-config`,
/// `sys/expire/secret/foo/1234`). Values are opaque byte arrays — always
/// encrypted by the barrier before reaching storage, with the sole exception
/// of the seal configuration, which must be readable while sealed.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. This is idempotent — deleting a non-existent key is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys that start with the given prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Query the optional HA coordination capability.
    ///
    /// Returns `None` for backends that cannot arbitrate leadership. The
    /// default is `None`; HA-capable backends override this to return
    /// themselves.
    fn ha(&self) -> Option<&dyn HaBackend> {
        None
    }
}

/// The highly-available coordination capability of a storage backend.
///
/// Provides advisory locks: at most one holder per key across every process
/// sharing the backend. The lock value is readable by non-holders, which is
/// how standby nodes discover the current leader.
pub trait HaBackend: Send + Sync {
    /// Create a lock handle for the given key carrying the given value.
    ///
    /// The lock is not acquired until [`AdvisoryLock::acquire`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Lock`] if the handle cannot be created.
    fn lock_with(&self, key: &str, value: &str)
        -> Result<Box<dyn AdvisoryLock>, StorageError>;
}

/// Completes (with `Err`, since the sender is dropped) when leadership is
/// lost. Holders await this receiver to observe demotion.
pub type LeaderLost = oneshot::Receiver<()>;

/// Stop signal for blocking acquisition: flips to `true` exactly once.
pub type StopSignal = watch::Receiver<bool>;

/// An advisory lock obtained from [`HaBackend::lock_with`].
#[async_trait::async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Block until the lock is held or `stop` fires.
    ///
    /// Returns `Ok(Some(_))` with the leader-lost signal once held, or
    /// `Ok(None)` if the stop signal fired first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Lock`] if the backend fails; callers are
    /// expected to retry.
    async fn acquire(&self, stop: StopSignal) -> Result<Option<LeaderLost>, StorageError>;

    /// Release the lock. Idempotent; releasing a lock that was never
    /// acquired is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Lock`] if the backend fails.
    async fn release(&self) -> Result<(), StorageError>;

    /// Read the lock state: whether any node holds it, and the held value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Lock`] if the backend fails.
    async fn value(&self) -> Result<(bool, String), StorageError>;
}
