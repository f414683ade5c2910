//! Mount tables.
//!
//! Three tables describe what is mounted where: logical backends,
//! credential (auth) backends, and audit sinks. Tables are protected
//! configuration — they live inside the barrier and are only loaded after
//! unseal. Each entry owns a UUID that roots the mount's storage view, so
//! remounting a backend type at a new path never aliases old data.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::barrier::Barrier;
use crate::error::MountError;

/// Barrier path of the logical mount table.
pub const CORE_MOUNTS_PATH: &str = "core/mounts";

/// Barrier path of the credential mount table.
pub const CORE_AUTH_PATH: &str = "core/auth";

/// Barrier path of the audit mount table.
pub const CORE_AUDIT_PATH: &str = "core/audit";

/// Route prefix under which all credential backends are mounted.
pub const CREDENTIAL_ROUTE_PREFIX: &str = "auth/";

/// A single mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountEntry {
    /// Path prefix relative to the table's namespace, ending in `/`
    /// (e.g. `secret/`, `token/`).
    pub path: String,
    /// Backend type resolved through the factory maps (e.g. `generic`,
    /// `system`, `token`).
    pub backend_type: String,
    /// Roots the mount's storage view.
    pub uuid: String,
    pub description: String,
}

impl MountEntry {
    /// Create an entry with a fresh UUID, normalizing the path to end
    /// in `/`.
    #[must_use]
    pub fn new(
        path: impl Into<String>,
        backend_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        Self {
            path,
            backend_type: backend_type.into(),
            uuid: Uuid::new_v4().to_string(),
            description: description.into(),
        }
    }
}

/// An ordered set of mount entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountTable {
    pub entries: Vec<MountEntry>,
}

impl MountTable {
    /// The table a freshly initialized core starts with: a generic
    /// backend at `secret/` and the system backend at `sys/`.
    #[must_use]
    pub fn default_logical() -> Self {
        Self {
            entries: vec![
                MountEntry::new("secret/", "generic", "generic secret storage"),
                MountEntry::new("sys/", "system", "system endpoints used for control, policy and debugging"),
            ],
        }
    }

    /// The default credential table: the token store at `token/`.
    #[must_use]
    pub fn default_credential() -> Self {
        Self {
            entries: vec![MountEntry::new("token/", "token", "token based credentials")],
        }
    }

    /// The default audit table: empty.
    #[must_use]
    pub fn default_audit() -> Self {
        Self::default()
    }

    /// Find the entry with the given path.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<&MountEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Remove and return the entry with the given path.
    pub fn remove(&mut self, path: &str) -> Option<MountEntry> {
        let idx = self.entries.iter().position(|e| e.path == path)?;
        Some(self.entries.remove(idx))
    }

    /// Load a table from the barrier, or fall back to `default` when the
    /// path has never been written.
    ///
    /// # Errors
    ///
    /// Returns [`MountError`] on storage or decode failure.
    pub async fn load(
        barrier: &Barrier,
        path: &str,
        default: impl FnOnce() -> Self,
    ) -> Result<Self, MountError> {
        match barrier.get(path).await? {
            Some(raw) => serde_json::from_slice(&raw).map_err(|e| MountError::Invalid {
                path: path.to_owned(),
                reason: e.to_string(),
            }),
            None => Ok(default()),
        }
    }

    /// Persist the table through the barrier.
    ///
    /// # Errors
    ///
    /// Returns [`MountError`] on storage or encode failure.
    pub async fn persist(&self, barrier: &Barrier, path: &str) -> Result<(), MountError> {
        let raw = serde_json::to_vec(self).map_err(|e| MountError::Invalid {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        barrier.put(path, &raw).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use coffer_storage::{MemoryBackend, StorageBackend};

    use super::*;

    async fn unsealed_barrier() -> Barrier {
        let physical = Arc::new(MemoryBackend::new());
        let barrier = Barrier::new(physical as Arc<dyn StorageBackend>);
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();
        barrier
    }

    #[test]
    fn default_logical_table_has_secret_and_sys() {
        let table = MountTable::default_logical();
        assert!(table.find("secret/").is_some());
        assert_eq!(table.find("sys/").unwrap().backend_type, "system");
    }

    #[test]
    fn default_credential_table_has_token() {
        let table = MountTable::default_credential();
        assert_eq!(table.find("token/").unwrap().backend_type, "token");
    }

    #[test]
    fn entry_path_is_normalized() {
        let entry = MountEntry::new("kv", "generic", "");
        assert_eq!(entry.path, "kv/");
    }

    #[test]
    fn entries_get_distinct_uuids() {
        let a = MountEntry::new("a/", "generic", "");
        let b = MountEntry::new("b/", "generic", "");
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn remove_returns_entry() {
        let mut table = MountTable::default_logical();
        let removed = table.remove("secret/").unwrap();
        assert_eq!(removed.backend_type, "generic");
        assert!(table.find("secret/").is_none());
        assert!(table.remove("secret/").is_none());
    }

    #[tokio::test]
    async fn load_missing_returns_default() {
        let barrier = unsealed_barrier().await;
        let table = MountTable::load(&barrier, CORE_MOUNTS_PATH, MountTable::default_logical)
            .await
            .unwrap();
        assert!(table.find("sys/").is_some());
    }

    #[tokio::test]
    async fn persist_then_load_roundtrip() {
        let barrier = unsealed_barrier().await;
        let mut table = MountTable::default_logical();
        table.entries.push(MountEntry::new("kv2/", "generic", "second store"));
        table.persist(&barrier, CORE_MOUNTS_PATH).await.unwrap();

        let loaded = MountTable::load(&barrier, CORE_MOUNTS_PATH, MountTable::default)
            .await
            .unwrap();
        assert_eq!(loaded.entries.len(), 3);
        assert_eq!(loaded.find("kv2/").unwrap().description, "second store");
    }

    #[tokio::test]
    async fn load_sealed_fails() {
        let physical = Arc::new(MemoryBackend::new());
        let barrier = Barrier::new(physical as Arc<dyn StorageBackend>);
        let err = MountTable::load(&barrier, CORE_MOUNTS_PATH, MountTable::default)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MountError::Barrier(crate::error::BarrierError::Sealed)
        ));
    }
}
