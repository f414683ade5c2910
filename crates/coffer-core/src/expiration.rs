//! Lease tracking and expiry-driven revocation.
//!
//! Every response carrying a secret or a non-root auth gets exactly one
//! lease. Lease records live under the `sys/expire/` view and are durably
//! persisted *before* their id is returned, so a crash can never leak a
//! usable lease the store has no record of.
//!
//! A background revoker sleeps until the soonest expiry, then revokes:
//! secret leases by replaying the backend's revoke hook through the
//! router, auth leases by revoking the token tree.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::LeaseError;
use crate::logical::{Auth, Operation, Request, Secret};
use crate::router::Router;
use crate::token::TokenStore;
use crate::view::BarrierView;

/// A persisted lease record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseEntry {
    /// `<request path>/<uuid>`, so prefix revocation is a listing.
    pub lease_id: String,
    /// Request path that issued the lease; also the revoke-hook target.
    pub path: String,
    pub issue_time: DateTime<Utc>,
    pub lease_duration_secs: i64,
    pub renewable: bool,
    /// Backend-private data replayed on the revoke hook.
    #[serde(default)]
    pub secret_data: Option<Value>,
    /// Token id for auth leases; revoked as a tree on expiry.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl LeaseEntry {
    /// When this lease expires.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issue_time + Duration::seconds(self.lease_duration_secs)
    }
}

/// Registers, renews, and revokes leases; owns the background revoker.
pub struct ExpirationManager {
    view: Arc<BarrierView>,
    router: Arc<Router>,
    tokens: Arc<TokenStore>,
    max_lease: Duration,
    /// Expiry queue ordered by (expiry, lease id). Never held across I/O.
    pending: Mutex<BTreeMap<(DateTime<Utc>, String), ()>>,
    /// Wakes the revoker when the queue front changes.
    wake: Notify,
}

impl ExpirationManager {
    /// Create a manager over its dedicated view.
    #[must_use]
    pub fn new(
        view: Arc<BarrierView>,
        router: Arc<Router>,
        tokens: Arc<TokenStore>,
        max_lease: Duration,
    ) -> Self {
        Self {
            view,
            router,
            tokens,
            max_lease,
            pending: Mutex::new(BTreeMap::new()),
            wake: Notify::new(),
        }
    }

    /// Load every persisted lease into the expiry queue. Called once
    /// during post-unseal, before the revoker starts.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] on storage or decode failure.
    pub async fn restore(&self) -> Result<usize, LeaseError> {
        let lease_ids = self.view.list("").await?;
        let mut restored = 0;

        for lease_id in &lease_ids {
            if let Some(entry) = self.load(lease_id).await? {
                self.schedule(&entry);
                restored += 1;
            }
        }

        if restored > 0 {
            info!(leases = restored, "lease records restored");
        }
        Ok(restored)
    }

    /// Register a lease for a secret response. The record is durable
    /// before the id is returned.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] if persisting fails.
    pub async fn register(&self, req: &Request, secret: &Secret) -> Result<String, LeaseError> {
        let entry = LeaseEntry {
            lease_id: format!("{}/{}", req.path, Uuid::new_v4()),
            path: req.path.clone(),
            issue_time: Utc::now(),
            lease_duration_secs: secret.lease_duration.num_seconds(),
            renewable: secret.renewable,
            secret_data: secret.internal_data.clone(),
            auth_token: None,
        };
        self.persist(&entry).await?;
        self.schedule(&entry);
        Ok(entry.lease_id)
    }

    /// Register a lease for a non-root auth response.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] if persisting fails.
    pub async fn register_auth(&self, path: &str, auth: &Auth) -> Result<String, LeaseError> {
        let entry = LeaseEntry {
            lease_id: format!("{}/{}", path, Uuid::new_v4()),
            path: path.to_owned(),
            issue_time: Utc::now(),
            lease_duration_secs: auth.lease_duration.num_seconds(),
            renewable: auth.renewable,
            secret_data: None,
            auth_token: Some(auth.client_token.clone()),
        };
        self.persist(&entry).await?;
        self.schedule(&entry);
        Ok(entry.lease_id)
    }

    /// Extend a lease by `increment`, bounded so the total lifetime never
    /// exceeds the maximum lease duration.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] for unknown leases.
    /// - [`LeaseError::NotRenewable`] for non-renewable leases.
    pub async fn renew(&self, lease_id: &str, increment: Duration) -> Result<LeaseEntry, LeaseError> {
        let mut entry = self
            .load(lease_id)
            .await?
            .ok_or_else(|| LeaseError::NotFound {
                lease_id: lease_id.to_owned(),
            })?;

        if !entry.renewable {
            return Err(LeaseError::NotRenewable {
                lease_id: lease_id.to_owned(),
            });
        }

        let old_key = (entry.expires_at(), entry.lease_id.clone());

        let requested = Utc::now() + increment;
        let cap = entry.issue_time + self.max_lease;
        let new_expiry = requested.min(cap);
        entry.lease_duration_secs = (new_expiry - entry.issue_time).num_seconds();

        self.persist(&entry).await?;
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&old_key);
            pending.insert((entry.expires_at(), entry.lease_id.clone()), ());
        }
        self.wake.notify_one();

        info!(lease_id = %entry.lease_id, new_ttl = entry.lease_duration_secs, "lease renewed");
        Ok(entry)
    }

    /// Revoke a lease immediately: run the issuing backend's revoke hook
    /// (or the token tree revocation), then delete the record.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] for unknown leases.
    /// - [`LeaseError::Revocation`] if the revoke hook fails.
    pub async fn revoke(&self, lease_id: &str) -> Result<(), LeaseError> {
        let entry = self
            .load(lease_id)
            .await?
            .ok_or_else(|| LeaseError::NotFound {
                lease_id: lease_id.to_owned(),
            })?;
        self.revoke_entry(&entry).await
    }

    /// Revoke every lease whose id starts with `prefix`. Used when a
    /// backend is unmounted.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] if listing or any revocation fails.
    pub async fn revoke_prefix(&self, prefix: &str) -> Result<usize, LeaseError> {
        let lease_ids = self.view.list(prefix).await?;
        let mut revoked = 0;

        for lease_id in &lease_ids {
            if let Some(entry) = self.load(lease_id).await? {
                self.revoke_entry(&entry).await?;
                revoked += 1;
            }
        }

        info!(prefix = %prefix, count = revoked, "leases revoked by prefix");
        Ok(revoked)
    }

    /// Number of leases currently queued for expiry.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Spawn the background revoker. It runs until `stop` flips to `true`.
    #[must_use]
    pub fn start(self: &Arc<Self>, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(manager.run(stop))
    }

    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                return;
            }

            let next = {
                let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.keys().next().cloned()
            };

            match next {
                None => {
                    tokio::select! {
                        changed = stop.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        () = self.wake.notified() => {}
                    }
                }
                Some((expires_at, lease_id)) => {
                    let delay = (expires_at - Utc::now())
                        .to_std()
                        .unwrap_or(StdDuration::ZERO);
                    tokio::select! {
                        changed = stop.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        () = self.wake.notified() => {}
                        () = tokio::time::sleep(delay) => {
                            self.expire(&lease_id, expires_at).await;
                        }
                    }
                }
            }
        }
    }

    /// Revoke a due lease, logging rather than propagating failures so one
    /// broken backend cannot wedge the revoker.
    async fn expire(&self, lease_id: &str, expires_at: DateTime<Utc>) {
        match self.load(lease_id).await {
            Ok(Some(entry)) => {
                if let Err(e) = self.revoke_entry(&entry).await {
                    warn!(lease_id = %lease_id, error = %e, "lease revocation failed");
                    // Drop it from the queue anyway; a retry storm against
                    // a broken backend helps nobody.
                    self.unschedule(expires_at, lease_id);
                } else {
                    info!(lease_id = %lease_id, "lease expired");
                }
            }
            Ok(None) => self.unschedule(expires_at, lease_id),
            Err(e) => {
                warn!(lease_id = %lease_id, error = %e, "lease load failed during expiry");
                self.unschedule(expires_at, lease_id);
            }
        }
    }

    async fn revoke_entry(&self, entry: &LeaseEntry) -> Result<(), LeaseError> {
        match &entry.auth_token {
            Some(token) => {
                self.tokens
                    .revoke_tree(token)
                    .await
                    .map_err(|e| LeaseError::Revocation {
                        lease_id: entry.lease_id.clone(),
                        reason: e.to_string(),
                    })?;
            }
            None => {
                let mut req = Request::new(Operation::Revoke, entry.path.clone());
                req.data = entry.secret_data.clone();
                self.router
                    .route(&req)
                    .await
                    .map_err(|e| LeaseError::Revocation {
                        lease_id: entry.lease_id.clone(),
                        reason: e.to_string(),
                    })?;
            }
        }

        self.view.delete(&entry.lease_id).await?;
        self.unschedule(entry.expires_at(), &entry.lease_id);
        Ok(())
    }

    async fn load(&self, lease_id: &str) -> Result<Option<LeaseEntry>, LeaseError> {
        match self.view.get(lease_id).await? {
            None => Ok(None),
            Some(raw) => {
                let entry =
                    serde_json::from_slice(&raw).map_err(|e| LeaseError::Serialization {
                        reason: e.to_string(),
                    })?;
                Ok(Some(entry))
            }
        }
    }

    async fn persist(&self, entry: &LeaseEntry) -> Result<(), LeaseError> {
        let raw = serde_json::to_vec(entry).map_err(|e| LeaseError::Serialization {
            reason: e.to_string(),
        })?;
        self.view.put(&entry.lease_id, &raw).await?;
        Ok(())
    }

    fn schedule(&self, entry: &LeaseEntry) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert((entry.expires_at(), entry.lease_id.clone()), ());
        drop(pending);
        self.wake.notify_one();
    }

    fn unschedule(&self, expires_at: DateTime<Utc>, lease_id: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&(expires_at, lease_id.to_owned()));
        drop(pending);
        self.wake.notify_one();
    }
}

impl fmt::Debug for ExpirationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpirationManager")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use coffer_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::barrier::Barrier;
    use crate::error::BackendError;
    use crate::logical::{Backend, Response};

    /// Counts revoke-hook invocations.
    #[derive(Default)]
    struct CountingBackend {
        revokes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Backend for CountingBackend {
        async fn handle_request(&self, req: &Request) -> Result<Option<Response>, BackendError> {
            if req.operation == Operation::Revoke {
                self.revokes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(None)
        }
    }

    struct Fixture {
        manager: Arc<ExpirationManager>,
        backend: Arc<CountingBackend>,
        tokens: Arc<TokenStore>,
    }

    async fn make_fixture() -> Fixture {
        let physical = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(physical as Arc<dyn StorageBackend>));
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();

        let router = Arc::new(Router::new());
        let backend = Arc::new(CountingBackend::default());
        router
            .mount(
                "secret/",
                Arc::clone(&backend) as Arc<dyn Backend>,
                Arc::new(BarrierView::new(Arc::clone(&barrier), "logical/kv/")),
            )
            .await
            .unwrap();

        let tokens = Arc::new(TokenStore::new(Arc::new(BarrierView::new(
            Arc::clone(&barrier),
            "auth/token-view/",
        ))));
        let manager = Arc::new(ExpirationManager::new(
            Arc::new(BarrierView::new(barrier, "sys/expire/")),
            router,
            Arc::clone(&tokens),
            Duration::days(32),
        ));

        Fixture {
            manager,
            backend,
            tokens,
        }
    }

    fn secret_with_ttl(secs: i64) -> Secret {
        Secret::with_duration(Duration::seconds(secs))
    }

    // ── register ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn register_persists_before_returning_id() {
        let fx = make_fixture().await;
        let req = Request::new(Operation::Read, "secret/db");
        let lease_id = fx
            .manager
            .register(&req, &secret_with_ttl(3600))
            .await
            .unwrap();

        assert!(lease_id.starts_with("secret/db/"));
        let stored = fx.manager.load(&lease_id).await.unwrap().unwrap();
        assert_eq!(stored.path, "secret/db");
        assert_eq!(stored.lease_duration_secs, 3600);
        assert_eq!(fx.manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn register_auth_records_token() {
        let fx = make_fixture().await;
        let auth = Auth {
            client_token: "tok-123".to_owned(),
            policies: vec!["default".to_owned()],
            metadata: HashMap::new(),
            display_name: "userpass-alice".to_owned(),
            lease_duration: Duration::seconds(600),
            renewable: true,
        };
        let lease_id = fx
            .manager
            .register_auth("auth/userpass/login/alice", &auth)
            .await
            .unwrap();

        let stored = fx.manager.load(&lease_id).await.unwrap().unwrap();
        assert_eq!(stored.auth_token.as_deref(), Some("tok-123"));
    }

    // ── renew ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn renew_extends_lease() {
        let fx = make_fixture().await;
        let req = Request::new(Operation::Read, "secret/db");
        let lease_id = fx
            .manager
            .register(&req, &secret_with_ttl(60))
            .await
            .unwrap();

        let renewed = fx
            .manager
            .renew(&lease_id, Duration::seconds(3600))
            .await
            .unwrap();
        assert!(renewed.lease_duration_secs > 60);
    }

    #[tokio::test]
    async fn renew_is_bounded_by_max_lease() {
        let fx = make_fixture().await;
        let req = Request::new(Operation::Read, "secret/db");
        let lease_id = fx
            .manager
            .register(&req, &secret_with_ttl(60))
            .await
            .unwrap();

        let renewed = fx
            .manager
            .renew(&lease_id, Duration::days(3650))
            .await
            .unwrap();
        assert!(renewed.lease_duration_secs <= Duration::days(32).num_seconds());
    }

    #[tokio::test]
    async fn renew_unknown_lease_fails() {
        let fx = make_fixture().await;
        let err = fx
            .manager
            .renew("secret/ghost/123", Duration::seconds(60))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn renew_non_renewable_fails() {
        let fx = make_fixture().await;
        let req = Request::new(Operation::Read, "secret/db");
        let mut secret = secret_with_ttl(60);
        secret.renewable = false;
        let lease_id = fx.manager.register(&req, &secret).await.unwrap();

        let err = fx
            .manager
            .renew(&lease_id, Duration::seconds(60))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::NotRenewable { .. }));
    }

    // ── revoke ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn revoke_runs_backend_hook_and_deletes_record() {
        let fx = make_fixture().await;
        let req = Request::new(Operation::Read, "secret/db");
        let lease_id = fx
            .manager
            .register(&req, &secret_with_ttl(3600))
            .await
            .unwrap();

        fx.manager.revoke(&lease_id).await.unwrap();
        assert_eq!(fx.backend.revokes.load(Ordering::SeqCst), 1);
        assert!(fx.manager.load(&lease_id).await.unwrap().is_none());
        assert_eq!(fx.manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn revoke_auth_lease_revokes_token_tree() {
        let fx = make_fixture().await;
        let root = fx.tokens.root_token().await.unwrap();

        let auth = Auth {
            client_token: root.id.clone(),
            policies: vec!["root".to_owned()],
            metadata: HashMap::new(),
            display_name: "root".to_owned(),
            lease_duration: Duration::seconds(600),
            renewable: true,
        };
        let lease_id = fx
            .manager
            .register_auth("auth/token/create", &auth)
            .await
            .unwrap();

        fx.manager.revoke(&lease_id).await.unwrap();
        assert!(fx.tokens.lookup(&root.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revoke_prefix_takes_all_matching_leases() {
        let fx = make_fixture().await;
        let req_a = Request::new(Operation::Read, "secret/a");
        let req_b = Request::new(Operation::Read, "secret/b");
        fx.manager
            .register(&req_a, &secret_with_ttl(3600))
            .await
            .unwrap();
        fx.manager
            .register(&req_a, &secret_with_ttl(3600))
            .await
            .unwrap();
        let keep = fx
            .manager
            .register(&req_b, &secret_with_ttl(3600))
            .await
            .unwrap();

        let revoked = fx.manager.revoke_prefix("secret/a/").await.unwrap();
        assert_eq!(revoked, 2);
        assert!(fx.manager.load(&keep).await.unwrap().is_some());
    }

    // ── background revoker ───────────────────────────────────────────

    #[tokio::test]
    async fn revoker_expires_due_leases() {
        let fx = make_fixture().await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = fx.manager.start(stop_rx);

        let req = Request::new(Operation::Read, "secret/db");
        let lease_id = fx
            .manager
            .register(&req, &secret_with_ttl(0))
            .await
            .unwrap();

        // The zero-duration lease is due immediately.
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        assert_eq!(fx.backend.revokes.load(Ordering::SeqCst), 1);
        assert!(fx.manager.load(&lease_id).await.unwrap().is_none());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn revoker_leaves_future_leases_alone() {
        let fx = make_fixture().await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = fx.manager.start(stop_rx);

        let req = Request::new(Operation::Read, "secret/db");
        let lease_id = fx
            .manager
            .register(&req, &secret_with_ttl(3600))
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert_eq!(fx.backend.revokes.load(Ordering::SeqCst), 0);
        assert!(fx.manager.load(&lease_id).await.unwrap().is_some());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn restore_reloads_persisted_leases() {
        let fx = make_fixture().await;
        let req = Request::new(Operation::Read, "secret/db");
        fx.manager
            .register(&req, &secret_with_ttl(3600))
            .await
            .unwrap();

        // A second manager over the same view simulates a restart.
        let fresh = Arc::new(ExpirationManager::new(
            Arc::clone(&fx.manager.view),
            Arc::clone(&fx.manager.router),
            Arc::clone(&fx.manager.tokens),
            Duration::days(32),
        ));
        let restored = fresh.restore().await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(fresh.pending_count(), 1);
    }
}
