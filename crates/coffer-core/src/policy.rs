//! Policy store and ACLs.
//!
//! Policies are named documents mapping path patterns (exact, or prefix via
//! a trailing `*`) to capability sets. A token carries policy names; per
//! request they are compiled into an [`Acl`], the union of all their rules
//! — the most permissive rule wins, there is no deny.
//!
//! The policy named `root` is built in: it grants every operation
//! everywhere, including root-protected paths, and can be neither written
//! nor deleted.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PolicyError;
use crate::logical::{pattern_match, Operation};
use crate::view::BarrierView;

/// A capability granted on matching paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Delete,
    List,
    /// Root privilege on root-protected paths.
    Sudo,
}

/// A single rule within a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Exact path, or prefix when ending in `*`.
    pub pattern: String,
    pub capabilities: Vec<Capability>,
}

/// A named policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub rules: Vec<PolicyRule>,
}

/// The built-in `root` policy. It has no rules: [`Acl`] special-cases it.
#[must_use]
pub fn root_policy() -> Policy {
    Policy {
        name: "root".to_owned(),
        rules: Vec::new(),
    }
}

/// Stores named policies under `sys/policy/` and compiles ACLs.
pub struct PolicyStore {
    view: Arc<BarrierView>,
}

impl PolicyStore {
    /// Create a policy store over its dedicated view.
    #[must_use]
    pub fn new(view: Arc<BarrierView>) -> Self {
        Self { view }
    }

    /// Write or replace a policy.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::Protected`] for the built-in `root` policy.
    /// - [`PolicyError::Invalid`] for an unnamed or encode-failing policy.
    /// - [`PolicyError::Barrier`] if persisting fails.
    pub async fn set_policy(&self, policy: &Policy) -> Result<(), PolicyError> {
        if policy.name == "root" {
            return Err(PolicyError::Protected {
                name: policy.name.clone(),
            });
        }
        if policy.name.is_empty() {
            return Err(PolicyError::Invalid {
                reason: "policy must have a name".to_owned(),
            });
        }

        let raw = serde_json::to_vec(policy).map_err(|e| PolicyError::Invalid {
            reason: format!("encode failed: {e}"),
        })?;
        self.view.put(&policy.name, &raw).await?;

        info!(name = %policy.name, rules = policy.rules.len(), "policy written");
        Ok(())
    }

    /// Fetch a policy by name. The built-in `root` policy is always
    /// available.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] on storage or decode failure.
    pub async fn get_policy(&self, name: &str) -> Result<Option<Policy>, PolicyError> {
        if name == "root" {
            return Ok(Some(root_policy()));
        }

        match self.view.get(name).await? {
            None => Ok(None),
            Some(raw) => {
                let policy =
                    serde_json::from_slice(&raw).map_err(|e| PolicyError::Invalid {
                        reason: format!("decode failed: {e}"),
                    })?;
                Ok(Some(policy))
            }
        }
    }

    /// Delete a policy by name.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::Protected`] for the built-in `root` policy.
    /// - [`PolicyError::Barrier`] if deletion fails.
    pub async fn delete_policy(&self, name: &str) -> Result<(), PolicyError> {
        if name == "root" {
            return Err(PolicyError::Protected {
                name: name.to_owned(),
            });
        }
        self.view.delete(name).await?;
        info!(name = %name, "policy deleted");
        Ok(())
    }

    /// List all policy names, always including `root`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Barrier`] if listing fails.
    pub async fn list_policies(&self) -> Result<Vec<String>, PolicyError> {
        let mut names = self.view.list("").await?;
        if !names.iter().any(|n| n == "root") {
            names.push("root".to_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Compile the named policies into an ACL.
    ///
    /// Names without a stored policy are skipped, so a token outlives the
    /// deletion of one of its policies with reduced rights rather than
    /// erroring.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] on storage or decode failure.
    pub async fn acl(&self, names: &[String]) -> Result<Acl, PolicyError> {
        let mut root = false;
        let mut rules = Vec::new();

        for name in names {
            if name == "root" {
                root = true;
                continue;
            }
            if let Some(policy) = self.get_policy(name).await? {
                rules.extend(policy.rules);
            }
        }

        Ok(Acl { root, rules })
    }
}

/// The compiled union of a token's policies.
#[derive(Debug, Clone)]
pub struct Acl {
    root: bool,
    rules: Vec<PolicyRule>,
}

impl Acl {
    /// Whether the ACL permits `op` on `path`.
    ///
    /// Internal operations (revoke, renew, rollback) are never
    /// user-initiated and always denied here.
    #[must_use]
    pub fn allow_operation(&self, op: Operation, path: &str) -> bool {
        if self.root {
            return true;
        }
        let Some(needed) = capability_for(op) else {
            return false;
        };
        self.rules
            .iter()
            .filter(|r| pattern_match(&r.pattern, path))
            .any(|r| r.capabilities.contains(&needed))
    }

    /// Whether the ACL grants root privilege on `path`: derived from the
    /// `root` policy, or any matching rule carrying `sudo`.
    #[must_use]
    pub fn root_privilege(&self, path: &str) -> bool {
        if self.root {
            return true;
        }
        self.rules
            .iter()
            .filter(|r| pattern_match(&r.pattern, path))
            .any(|r| r.capabilities.contains(&Capability::Sudo))
    }
}

fn capability_for(op: Operation) -> Option<Capability> {
    match op {
        Operation::Read => Some(Capability::Read),
        Operation::Write => Some(Capability::Write),
        Operation::Delete => Some(Capability::Delete),
        Operation::List => Some(Capability::List),
        Operation::Revoke | Operation::Renew | Operation::Rollback => None,
    }
}

impl fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use coffer_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::barrier::Barrier;

    async fn make_store() -> PolicyStore {
        let physical = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(physical as Arc<dyn StorageBackend>));
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();
        PolicyStore::new(Arc::new(BarrierView::new(barrier, "sys/policy/")))
    }

    fn policy(name: &str, rules: &[(&str, &[Capability])]) -> Policy {
        Policy {
            name: name.to_owned(),
            rules: rules
                .iter()
                .map(|(pattern, caps)| PolicyRule {
                    pattern: (*pattern).to_owned(),
                    capabilities: caps.to_vec(),
                })
                .collect(),
        }
    }

    // ── CRUD ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn set_and_get_roundtrip() {
        let store = make_store().await;
        let p = policy("dev", &[("secret/dev/*", &[Capability::Read, Capability::List])]);
        store.set_policy(&p).await.unwrap();

        let fetched = store.get_policy("dev").await.unwrap().unwrap();
        assert_eq!(fetched.name, "dev");
        assert_eq!(fetched.rules.len(), 1);
    }

    #[tokio::test]
    async fn get_unknown_returns_none() {
        let store = make_store().await;
        assert!(store.get_policy("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_policy() {
        let store = make_store().await;
        let p = policy("temp", &[("secret/*", &[Capability::Read])]);
        store.set_policy(&p).await.unwrap();
        store.delete_policy("temp").await.unwrap();
        assert!(store.get_policy("temp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn root_policy_is_protected() {
        let store = make_store().await;
        let err = store.set_policy(&root_policy()).await.unwrap_err();
        assert!(matches!(err, PolicyError::Protected { .. }));
        let err = store.delete_policy("root").await.unwrap_err();
        assert!(matches!(err, PolicyError::Protected { .. }));
    }

    #[tokio::test]
    async fn root_policy_is_always_gettable() {
        let store = make_store().await;
        assert!(store.get_policy("root").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_includes_root_and_custom() {
        let store = make_store().await;
        store
            .set_policy(&policy("dev", &[("secret/*", &[Capability::Read])]))
            .await
            .unwrap();

        let names = store.list_policies().await.unwrap();
        assert!(names.contains(&"root".to_owned()));
        assert!(names.contains(&"dev".to_owned()));
    }

    // ── ACL compilation ──────────────────────────────────────────────

    #[tokio::test]
    async fn acl_grants_matching_capability() {
        let store = make_store().await;
        store
            .set_policy(&policy("readonly", &[("secret/*", &[Capability::Read])]))
            .await
            .unwrap();

        let acl = store.acl(&["readonly".to_owned()]).await.unwrap();
        assert!(acl.allow_operation(Operation::Read, "secret/foo"));
        assert!(!acl.allow_operation(Operation::Write, "secret/foo"));
        assert!(!acl.allow_operation(Operation::Read, "other/foo"));
    }

    #[tokio::test]
    async fn acl_union_is_most_permissive() {
        let store = make_store().await;
        store
            .set_policy(&policy("reader", &[("secret/shared/*", &[Capability::Read])]))
            .await
            .unwrap();
        store
            .set_policy(&policy("writer", &[("secret/shared/*", &[Capability::Write])]))
            .await
            .unwrap();

        let acl = store
            .acl(&["reader".to_owned(), "writer".to_owned()])
            .await
            .unwrap();
        assert!(acl.allow_operation(Operation::Read, "secret/shared/key"));
        assert!(acl.allow_operation(Operation::Write, "secret/shared/key"));
        assert!(!acl.allow_operation(Operation::Delete, "secret/shared/key"));
    }

    #[tokio::test]
    async fn exact_pattern_does_not_match_children() {
        let store = make_store().await;
        store
            .set_policy(&policy("pin", &[("secret/exact", &[Capability::Read])]))
            .await
            .unwrap();

        let acl = store.acl(&["pin".to_owned()]).await.unwrap();
        assert!(acl.allow_operation(Operation::Read, "secret/exact"));
        assert!(!acl.allow_operation(Operation::Read, "secret/exact/child"));
    }

    #[tokio::test]
    async fn missing_policy_is_skipped() {
        let store = make_store().await;
        let acl = store.acl(&["ghost".to_owned()]).await.unwrap();
        assert!(!acl.allow_operation(Operation::Read, "secret/foo"));
    }

    #[tokio::test]
    async fn empty_acl_denies_everything() {
        let store = make_store().await;
        let acl = store.acl(&[]).await.unwrap();
        assert!(!acl.allow_operation(Operation::Read, "secret/foo"));
        assert!(!acl.root_privilege("sys/mounts/x"));
    }

    // ── root privilege ───────────────────────────────────────────────

    #[tokio::test]
    async fn root_policy_grants_everything() {
        let store = make_store().await;
        let acl = store.acl(&["root".to_owned()]).await.unwrap();
        assert!(acl.allow_operation(Operation::Read, "any/path"));
        assert!(acl.allow_operation(Operation::Delete, "any/path"));
        assert!(acl.root_privilege("sys/mounts/secret/"));
    }

    #[tokio::test]
    async fn sudo_grants_root_privilege_on_matching_paths() {
        let store = make_store().await;
        store
            .set_policy(&policy(
                "ops",
                &[("sys/mounts/*", &[Capability::Write, Capability::Sudo])],
            ))
            .await
            .unwrap();

        let acl = store.acl(&["ops".to_owned()]).await.unwrap();
        assert!(acl.root_privilege("sys/mounts/kv/"));
        assert!(!acl.root_privilege("sys/policy/dev"));
    }

    #[tokio::test]
    async fn internal_operations_never_allowed() {
        let store = make_store().await;
        let acl = store.acl(&["root".to_owned()]).await.unwrap();
        // Root bypasses the capability table entirely.
        assert!(acl.allow_operation(Operation::Revoke, "secret/foo"));

        store
            .set_policy(&policy("all", &[("*", &[Capability::Read, Capability::Write])]))
            .await
            .unwrap();
        let acl = store.acl(&["all".to_owned()]).await.unwrap();
        assert!(!acl.allow_operation(Operation::Revoke, "secret/foo"));
        assert!(!acl.allow_operation(Operation::Rollback, "secret/foo"));
    }
}
