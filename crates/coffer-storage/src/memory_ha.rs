//! In-memory storage backend with advisory locks.
//!
//! Behaves exactly like [`MemoryBackend`] for data, and additionally offers
//! the HA coordination capability: per-key advisory locks shared by every
//! clone of the backend. Multiple cores constructed over clones of one
//! `MemoryHaBackend` therefore elect a single leader, which makes this the
//! backend of choice for failover tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify};

use crate::{AdvisoryLock, HaBackend, LeaderLost, MemoryBackend, StopSignal, StorageBackend, StorageError};

/// A lock currently held by some acquirer.
struct HeldLock {
    value: String,
    holder: u64,
    /// Dropped when the entry is removed, which closes the holder's
    /// leader-lost receiver.
    _lost_tx: oneshot::Sender<()>,
}

/// Shared advisory-lock table.
struct LockTable {
    state: Mutex<HashMap<String, HeldLock>>,
    released: Notify,
    next_holder: AtomicU64,
}

/// An in-memory backend whose clones share both data and advisory locks.
#[derive(Clone)]
pub struct MemoryHaBackend {
    data: MemoryBackend,
    locks: Arc<LockTable>,
}

impl MemoryHaBackend {
    /// Create a new empty HA-capable in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: MemoryBackend::new(),
            locks: Arc::new(LockTable {
                state: Mutex::new(HashMap::new()),
                released: Notify::new(),
                next_holder: AtomicU64::new(1),
            }),
        }
    }

    /// Forcibly drop the lock on `key`, regardless of holder.
    ///
    /// Fault injection for tests: the holder observes this as a loss of
    /// leadership, exactly as if its session with a real coordination
    /// service had expired.
    pub fn expire_lock(&self, key: &str) {
        let mut state = self.locks.state.lock().unwrap_or_else(|e| e.into_inner());
        state.remove(key);
        drop(state);
        self.locks.released.notify_waiters();
    }
}

impl Default for MemoryHaBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryHaBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.data.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.data.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.data.list(prefix).await
    }

    fn ha(&self) -> Option<&dyn HaBackend> {
        Some(self)
    }
}

impl HaBackend for MemoryHaBackend {
    fn lock_with(&self, key: &str, value: &str)
        -> Result<Box<dyn AdvisoryLock>, StorageError> {
        Ok(Box::new(MemoryLock {
            table: Arc::clone(&self.locks),
            key: key.to_owned(),
            value: value.to_owned(),
            holder: Mutex::new(None),
        }))
    }
}

/// An advisory lock handle over the shared table.
struct MemoryLock {
    table: Arc<LockTable>,
    key: String,
    value: String,
    /// Holder id recorded once acquired, so release only removes our own
    /// acquisition.
    holder: Mutex<Option<u64>>,
}

#[async_trait::async_trait]
impl AdvisoryLock for MemoryLock {
    async fn acquire(&self, mut stop: StopSignal) -> Result<Option<LeaderLost>, StorageError> {
        loop {
            if *stop.borrow() {
                return Ok(None);
            }

            // Register for the release notification before inspecting the
            // table, so a release between the check and the await is not
            // missed.
            let released = self.table.released.notified();

            {
                let mut state = self.table.state.lock().unwrap_or_else(|e| e.into_inner());
                if !state.contains_key(&self.key) {
                    let (lost_tx, lost_rx) = oneshot::channel();
                    let holder = self.table.next_holder.fetch_add(1, Ordering::Relaxed);
                    state.insert(
                        self.key.clone(),
                        HeldLock {
                            value: self.value.clone(),
                            holder,
                            _lost_tx: lost_tx,
                        },
                    );
                    *self.holder.lock().unwrap_or_else(|e| e.into_inner()) = Some(holder);
                    return Ok(Some(lost_rx));
                }
            }

            tokio::select! {
                () = released => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn release(&self) -> Result<(), StorageError> {
        let holder = self.holder.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(holder) = holder else {
            return Ok(());
        };

        let mut state = self.table.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.get(&self.key).is_some_and(|h| h.holder == holder) {
            state.remove(&self.key);
        }
        drop(state);
        self.table.released.notify_waiters();
        Ok(())
    }

    async fn value(&self) -> Result<(bool, String), StorageError> {
        let state = self.table.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.get(&self.key) {
            Some(held) => Ok((true, held.value.clone())),
            None => Ok((false, String::new())),
        }
    }
}
