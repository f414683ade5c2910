//! The Core: seal state machine, request pipeline, and HA coordination.
//!
//! The Core is the single point of interface for embedding layers. It owns
//! the barrier, the router, and every manager component, and it is the only
//! place that sequences their bring-up and tear-down:
//!
//! - `initialize` creates the barrier keyring, splits the master key into
//!   Shamir shares, mints the root token, and leaves the store sealed.
//! - `unseal` collects key shares until the threshold is met, then either
//!   becomes active (no HA) or enters the standby loop (HA).
//! - `handle_request` runs token → ACL → route → lease → audit.
//! - `seal` tears everything back down, waiting out in-flight requests.
//!
//! A single reader-writer lock guards the seal/standby flags and unseal
//! progress. Requests hold the read side for their entire lifetime, so
//! sealing waits for in-flight requests; the standby loop takes the write
//! side only around promotion and demotion, never while awaiting the
//! leader-lost signal.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use chrono::Duration;
use coffer_storage::{AdvisoryLock, LeaderLost, StorageBackend};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit::AuditBroker;
use crate::barrier::Barrier;
use crate::cache::PhysicalCache;
use crate::error::{BackendError, BarrierError, CoreError, RouteError};
use crate::expiration::ExpirationManager;
use crate::logical::{
    Auth, Backend, BackendFactory, AuditFactory, Operation, Request, Response,
};
use crate::mount::{
    MountEntry, MountTable, CORE_AUDIT_PATH, CORE_AUTH_PATH, CORE_MOUNTS_PATH,
    CREDENTIAL_ROUTE_PREFIX,
};
use crate::passthrough::PassthroughBackend;
use crate::policy::PolicyStore;
use crate::router::Router;
use crate::hardening;
use crate::shamir;
use crate::system::SystemBackend;
use crate::token::{TokenEntry, TokenStore};
use crate::view::BarrierView;

/// Plaintext path of the seal configuration: it must be readable while
/// sealed to know how many shares reconstruct the master key.
pub const SEAL_CONFIG_PATH: &str = "core/seal-config";

/// Advisory-lock path coordinating a highly-available deployment.
pub const CORE_LOCK_PATH: &str = "core/lock";

/// Barrier prefix under which the elected leader advertises its address,
/// keyed by the leader's lock UUID.
pub const CORE_LEADER_PREFIX: &str = "core/leader/";

/// Barrier path of the audit HMAC key.
const AUDIT_HMAC_KEY_PATH: &str = "core/audit-hmac-key";

/// Interval between lock re-acquisition attempts after an error.
const LOCK_RETRY_INTERVAL: StdDuration = StdDuration::from_secs(10);

/// Interval of the metrics emitter.
const METRICS_INTERVAL: StdDuration = StdDuration::from_secs(1);

/// Seal configuration: how the master key is split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealConfig {
    /// N: number of shares the master key is split into.
    pub secret_shares: u8,
    /// T: shares required to reconstruct it.
    pub secret_threshold: u8,
}

impl SealConfig {
    /// Sanity-check the configuration: `1 ≤ T ≤ N ≤ 255`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRequest`] on violation.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.secret_shares < 1 {
            return Err(CoreError::InvalidRequest(
                "secret shares must be at least one".to_owned(),
            ));
        }
        if self.secret_threshold < 1 {
            return Err(CoreError::InvalidRequest(
                "secret threshold must be at least one".to_owned(),
            ));
        }
        if self.secret_threshold > self.secret_shares {
            return Err(CoreError::InvalidRequest(
                "secret threshold cannot be larger than secret shares".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Returned exactly once from [`Core::initialize`]. Shares are emitted to
/// the caller and never persisted.
#[derive(Debug)]
pub struct InitResult {
    /// The N key shares; buffers are zeroized when dropped.
    pub secret_shares: Vec<Zeroizing<Vec<u8>>>,
    pub root_token: String,
}

/// Point-in-time seal status.
#[derive(Debug, Clone, Serialize)]
pub struct SealStatus {
    pub initialized: bool,
    pub sealed: bool,
    pub standby: bool,
    /// Shares submitted towards the current unseal attempt.
    pub progress: usize,
    pub secret_shares: u8,
    pub secret_threshold: u8,
}

/// Parameters for constructing a [`Core`].
pub struct CoreConfig {
    pub physical: Arc<dyn StorageBackend>,
    /// Address advertised while leader. Required iff the physical backend
    /// offers the HA capability.
    pub advertise_addr: String,
    pub disable_cache: bool,
    /// Cached entries; 0 means the default.
    pub cache_size: u64,
    pub disable_mlock: bool,
    pub default_lease_duration: Duration,
    pub max_lease_duration: Duration,
    pub logical_backends: HashMap<String, BackendFactory>,
    pub credential_backends: HashMap<String, BackendFactory>,
    pub audit_backends: HashMap<String, AuditFactory>,
}

impl CoreConfig {
    /// A configuration with defaults over the given physical backend.
    #[must_use]
    pub fn new(physical: Arc<dyn StorageBackend>) -> Self {
        Self {
            physical,
            advertise_addr: String::new(),
            disable_cache: false,
            cache_size: 0,
            disable_mlock: false,
            default_lease_duration: Duration::hours(24),
            max_lease_duration: Duration::days(32),
            logical_backends: HashMap::new(),
            credential_backends: HashMap::new(),
            audit_backends: HashMap::new(),
        }
    }
}

/// Mutable seal state, guarded by the single state lock.
struct SealState {
    sealed: bool,
    standby: bool,
    /// Shares collected towards the current unseal attempt.
    unlock_parts: Vec<Zeroizing<Vec<u8>>>,
    standby_stop: Option<watch::Sender<bool>>,
    standby_done: Option<oneshot::Receiver<()>>,
}

/// A stoppable background task.
struct StopHandle {
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StopHandle {
    fn new(stop: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    async fn stop(&self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "background task join failed");
            }
        }
    }
}

/// Everything that only exists while unsealed and active. Installed as one
/// unit at the end of post-unseal, removed as one unit by pre-seal.
#[derive(Clone)]
pub(crate) struct Managers {
    pub(crate) logical_mounts: Arc<Mutex<MountTable>>,
    pub(crate) credential_mounts: Arc<Mutex<MountTable>>,
    pub(crate) audit_mounts: Arc<Mutex<MountTable>>,
    pub(crate) policy: Arc<PolicyStore>,
    pub(crate) tokens: Arc<TokenStore>,
    pub(crate) expiration: Arc<ExpirationManager>,
    pub(crate) audit: Arc<AuditBroker>,
    rollback: Arc<crate::rollback::RollbackManager>,
    expiration_task: Arc<StopHandle>,
    metrics_task: Arc<StopHandle>,
}

/// The central manager of all activity.
pub struct Core {
    self_ref: Weak<Core>,
    /// The physical backend, possibly wrapped in the cache.
    physical: Arc<dyn StorageBackend>,
    cache: Option<Arc<PhysicalCache>>,
    ha_enabled: bool,
    advertise_addr: String,
    barrier: Arc<Barrier>,
    router: Arc<Router>,
    default_lease: Duration,
    max_lease: Duration,
    logical_factories: HashMap<String, BackendFactory>,
    credential_factories: HashMap<String, BackendFactory>,
    audit_factories: HashMap<String, AuditFactory>,
    state: RwLock<SealState>,
    managers: RwLock<Option<Managers>>,
}

impl Core {
    /// Construct a new sealed core.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRequest`] if the physical backend is
    /// HA-capable but no advertise address was configured.
    pub fn new(mut config: CoreConfig) -> Result<Arc<Self>, CoreError> {
        let ha_enabled = config.physical.ha().is_some();
        if ha_enabled && config.advertise_addr.is_empty() {
            return Err(CoreError::InvalidRequest(
                "missing advertisement address".to_owned(),
            ));
        }

        // Swapped pages and core files both leak key material; harden
        // unless the embedder opted out.
        if !config.disable_mlock {
            let status = hardening::harden();
            debug!(
                memory_locked = status.memory_locked,
                core_dumps_disabled = status.core_dumps_disabled,
                "process hardening applied"
            );
        }

        let (physical, cache): (Arc<dyn StorageBackend>, Option<Arc<PhysicalCache>>) =
            if config.disable_cache {
                (config.physical, None)
            } else {
                let cache = Arc::new(PhysicalCache::new(config.physical, config.cache_size));
                (Arc::clone(&cache) as Arc<dyn StorageBackend>, Some(cache))
            };

        let barrier = Arc::new(Barrier::new(Arc::clone(&physical)));

        // Built-in backend types, unless the embedder overrode them.
        config
            .logical_backends
            .entry("generic".to_owned())
            .or_insert_with(|| {
                Arc::new(|view| {
                    Ok(Arc::new(PassthroughBackend::new(view)) as Arc<dyn Backend>)
                })
            });

        Ok(Arc::new_cyclic(|weak| Core {
            self_ref: weak.clone(),
            physical,
            cache,
            ha_enabled,
            advertise_addr: config.advertise_addr,
            barrier,
            router: Arc::new(Router::new()),
            default_lease: config.default_lease_duration,
            max_lease: config.max_lease_duration,
            logical_factories: config.logical_backends,
            credential_factories: config.credential_backends,
            audit_factories: config.audit_backends,
            state: RwLock::new(SealState {
                sealed: true,
                standby: true,
                unlock_parts: Vec::new(),
                standby_stop: None,
                standby_done: None,
            }),
            managers: RwLock::new(None),
        }))
    }

    // ── status queries ───────────────────────────────────────────────

    /// Whether the store has been initialized.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] on storage failure.
    pub async fn initialized(&self) -> Result<bool, CoreError> {
        let barrier_init = self.barrier.initialized().await.map_err(|e| {
            error!(error = %e, "barrier init check failed");
            CoreError::Internal
        })?;
        if !barrier_init {
            return Ok(false);
        }
        Ok(self.seal_config().await?.is_some())
    }

    /// Whether the store is currently sealed.
    pub async fn sealed(&self) -> bool {
        self.state.read().await.sealed
    }

    /// Whether this node is a standby.
    pub async fn standby(&self) -> bool {
        self.state.read().await.standby
    }

    /// Shares submitted towards the current unseal attempt.
    pub async fn secret_progress(&self) -> usize {
        self.state.read().await.unlock_parts.len()
    }

    /// Point-in-time seal status.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] on storage failure.
    pub async fn seal_status(&self) -> Result<SealStatus, CoreError> {
        let config = self.seal_config().await?;
        let state = self.state.read().await;
        Ok(SealStatus {
            initialized: config.is_some(),
            sealed: state.sealed,
            standby: state.standby,
            progress: state.unlock_parts.len(),
            secret_shares: config.as_ref().map_or(0, |c| c.secret_shares),
            secret_threshold: config.as_ref().map_or(0, |c| c.secret_threshold),
        })
    }

    /// Read and validate the persisted seal configuration. `None` means
    /// uninitialized.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] on storage or decode failure.
    pub async fn seal_config(&self) -> Result<Option<SealConfig>, CoreError> {
        let raw = self.physical.get(SEAL_CONFIG_PATH).await.map_err(|e| {
            error!(error = %e, "failed to read seal configuration");
            CoreError::Internal
        })?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let config: SealConfig = serde_json::from_slice(&raw).map_err(|e| {
            error!(error = %e, "failed to decode seal configuration");
            CoreError::Internal
        })?;
        config.validate()?;
        Ok(Some(config))
    }

    // ── initialization ───────────────────────────────────────────────

    /// Initialize a fresh store: persist the seal configuration, create
    /// the barrier keyring, split the master key, mint the root token.
    /// The store is left sealed.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidRequest`] on a bad seal configuration.
    /// - [`CoreError::AlreadyInitialized`] on a second initialization.
    /// - [`CoreError::Internal`] on storage failure.
    pub async fn initialize(&self, config: &SealConfig) -> Result<InitResult, CoreError> {
        config.validate()?;

        // Hold the write lock so initialization cannot race unseal.
        let _state = self.state.write().await;

        if self.initialized().await? {
            return Err(CoreError::AlreadyInitialized);
        }

        let raw = serde_json::to_vec(config).map_err(|e| {
            error!(error = %e, "failed to encode seal configuration");
            CoreError::Internal
        })?;
        self.physical
            .put(SEAL_CONFIG_PATH, &raw)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to store seal configuration");
                CoreError::Internal
            })?;

        let master = Barrier::generate_key();
        self.barrier.initialize(&master).await.map_err(|e| match e {
            BarrierError::AlreadyInitialized => CoreError::AlreadyInitialized,
            other => {
                error!(error = %other, "barrier initialization failed");
                CoreError::Internal
            }
        })?;

        let secret_shares = if config.secret_shares == 1 {
            vec![Zeroizing::new(master.to_vec())]
        } else {
            shamir::split(&master, config.secret_shares, config.secret_threshold).map_err(
                |e| {
                    error!(error = %e, "failed to generate key shares");
                    CoreError::Internal
                },
            )?
        };
        info!("security barrier initialized");

        // Briefly unseal to run the bring-up and mint the root token.
        self.barrier.unseal(&master).await.map_err(|e| {
            error!(error = %e, "failed to unseal barrier");
            CoreError::Internal
        })?;

        if let Err(e) = self.post_unseal().await {
            error!(error = %e, "post-unseal setup failed during initialization");
            self.barrier.seal().await;
            return Err(e);
        }

        let root_token = {
            let managers = self.managers.read().await.clone();
            let Some(managers) = managers else {
                self.barrier.seal().await;
                return Err(CoreError::Internal);
            };
            match managers.tokens.root_token().await {
                Ok(entry) => entry.id,
                Err(e) => {
                    error!(error = %e, "root token generation failed");
                    let _ = self.pre_seal().await;
                    self.barrier.seal().await;
                    return Err(CoreError::Internal);
                }
            }
        };
        info!("root token generated");

        if let Err(e) = self.pre_seal().await {
            error!(error = %e, "pre-seal teardown failed during initialization");
            self.barrier.seal().await;
            return Err(e);
        }
        self.barrier.seal().await;

        Ok(InitResult {
            secret_shares,
            root_token,
        })
    }

    // ── unseal ───────────────────────────────────────────────────────

    /// Submit one key share. Returns `true` once the store is unsealed.
    ///
    /// Duplicate shares are ignored without affecting progress. When the
    /// threshold is met the shares are combined, zeroized, and the barrier
    /// unsealed; on an HA deployment the node enters standby, otherwise it
    /// becomes active immediately.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidKey`] on a wrong-length or unrecoverable key.
    /// - [`CoreError::NotInitialized`] before initialization.
    pub async fn unseal(&self, key: &[u8]) -> Result<bool, CoreError> {
        let (min, max) = Barrier::key_length();
        let max = max + shamir::SHARE_OVERHEAD;
        if key.len() < min {
            return Err(CoreError::InvalidKey {
                reason: format!("key is shorter than minimum {min} bytes"),
            });
        }
        if key.len() > max {
            return Err(CoreError::InvalidKey {
                reason: format!("key is longer than maximum {max} bytes"),
            });
        }

        let config = self
            .seal_config()
            .await?
            .ok_or(CoreError::NotInitialized)?;

        let mut state = self.state.write().await;
        if !state.sealed {
            return Ok(true);
        }

        if state.unlock_parts.iter().any(|p| p.as_slice() == key) {
            return Ok(false);
        }
        state.unlock_parts.push(Zeroizing::new(key.to_vec()));

        if state.unlock_parts.len() < usize::from(config.secret_threshold) {
            debug!(
                progress = state.unlock_parts.len(),
                threshold = config.secret_threshold,
                "cannot unseal, need more keys"
            );
            return Ok(false);
        }

        // Threshold met: consume the shares and recover the master key.
        let parts = std::mem::take(&mut state.unlock_parts);
        let master = if config.secret_shares == 1 {
            match parts.into_iter().next() {
                Some(part) => part,
                None => return Err(CoreError::Internal),
            }
        } else {
            shamir::combine(&parts, config.secret_threshold).map_err(|e| {
                CoreError::InvalidKey {
                    reason: e.to_string(),
                }
            })?
        };

        self.barrier.unseal(&master).await.map_err(|e| match e {
            BarrierError::InvalidKey { reason } => CoreError::InvalidKey { reason },
            BarrierError::NotInitialized => CoreError::NotInitialized,
            other => {
                error!(error = %other, "barrier unseal failed");
                CoreError::Internal
            }
        })?;
        info!("coffer unsealed");

        if self.ha_enabled {
            // Wait in standby until the lock is won.
            let (stop_tx, stop_rx) = watch::channel(false);
            let (done_tx, done_rx) = oneshot::channel();
            state.standby_stop = Some(stop_tx);
            state.standby_done = Some(done_rx);

            let Some(core) = self.self_ref.upgrade() else {
                return Err(CoreError::Internal);
            };
            tokio::spawn(core.run_standby(stop_rx, done_tx));
        } else {
            if let Err(e) = self.post_unseal().await {
                error!(error = %e, "post-unseal setup failed");
                self.barrier.seal().await;
                warn!("coffer re-sealed");
                return Err(e);
            }
            state.standby = false;
        }

        state.sealed = false;
        Ok(true)
    }

    // ── seal ─────────────────────────────────────────────────────────

    /// Seal the store. Requires a token with root-level access to
    /// `sys/seal`. Waits for in-flight requests, tears the managers down,
    /// and zeroizes the barrier's in-memory keys.
    ///
    /// # Errors
    ///
    /// - [`CoreError::PermissionDenied`] if the token may not seal.
    pub async fn seal(&self, token: &str) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        if state.sealed {
            return Ok(());
        }

        {
            let managers = self.managers.read().await.clone();
            let Some(managers) = managers else {
                error!("sealing without managers installed");
                return Err(CoreError::Internal);
            };
            self.check_token(&managers, Operation::Write, "sys/seal", token)
                .await?;
        }

        state.sealed = true;

        if self.ha_enabled {
            if let Some(stop) = state.standby_stop.take() {
                let _ = stop.send(true);
            }
            let done = state.standby_done.take();

            // Release the state lock while the standby loop demotes, or
            // Seal would deadlock with its pre-seal transition.
            drop(state);
            if let Some(done) = done {
                let _ = done.await;
            }
        } else if let Err(e) = self.pre_seal().await {
            warn!(error = %e, "pre-seal teardown failed");
        }

        self.barrier.seal().await;
        info!("coffer sealed");
        Ok(())
    }

    // ── request pipeline ─────────────────────────────────────────────

    /// Handle a request: token check, ACL check, route, lease
    /// registration, audit.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Sealed`] / [`CoreError::Standby`] outside active
    ///   operation.
    /// - [`CoreError::PermissionDenied`] on token or ACL failure.
    /// - [`CoreError::InvalidRequest`] for malformed requests; the message
    ///   is safe for the client.
    /// - [`CoreError::Internal`] for storage, audit, or registration
    ///   failures (detail in the logs only).
    pub async fn handle_request(&self, req: &Request) -> Result<Response, CoreError> {
        // Held for the whole request so sealing waits for us.
        let _state = {
            let state = self.state.read().await;
            if state.sealed {
                return Err(CoreError::Sealed);
            }
            if state.standby {
                return Err(CoreError::Standby);
            }
            state
        };

        let managers = self.managers.read().await.clone();
        let Some(managers) = managers else {
            error!("request while managers are not installed");
            return Err(CoreError::Internal);
        };

        if self.router.login_path(&req.path).await {
            self.handle_login(&managers, req).await
        } else {
            self.handle_authenticated(&managers, req).await
        }
    }

    async fn handle_authenticated(
        &self,
        managers: &Managers,
        req: &Request,
    ) -> Result<Response, CoreError> {
        let auth = self
            .check_token(managers, req.operation, &req.path, &req.client_token)
            .await?;

        let mut req = req.clone();
        req.display_name = auth.display_name.clone();

        managers
            .audit
            .log_request(Some(&auth), &req)
            .await
            .map_err(|e| {
                error!(error = %e, path = %req.path, "failed to audit request");
                CoreError::Internal
            })?;

        let (mut resp, route_err) = split_route_result(self.router.route(&req).await);

        if let Some(resp) = resp.as_mut() {
            // Register a lease for any secret in the response.
            if let Some(secret) = resp.secret.as_mut() {
                secret.lease_duration =
                    clamp_lease(secret.lease_duration, self.default_lease, self.max_lease);
                let lease_id =
                    managers
                        .expiration
                        .register(&req, secret)
                        .await
                        .map_err(|e| {
                            error!(error = %e, path = %req.path, "failed to register lease");
                            CoreError::Internal
                        })?;
                secret.lease_id = lease_id;
            }

            // Only the token store may return an auth block here.
            if resp.auth.is_some() && !req.path.starts_with("auth/token/") {
                error!(path = %req.path, "unexpected auth response from non-token backend");
                return Err(CoreError::Internal);
            }
            if let Some(resp_auth) = resp.auth.as_mut() {
                let root_holder = resp_auth.policies.iter().any(|p| p == "root");
                if resp_auth.lease_duration.is_zero() && !root_holder {
                    resp_auth.lease_duration = self.default_lease;
                }
                if resp_auth.lease_duration > self.max_lease {
                    resp_auth.lease_duration = self.max_lease;
                }
                if !root_holder {
                    managers
                        .expiration
                        .register_auth(&req.path, resp_auth)
                        .await
                        .map_err(|e| {
                            error!(error = %e, path = %req.path, "failed to register token lease");
                            CoreError::Internal
                        })?;
                }
            }
        }

        let err_str = route_err.as_ref().map(ToString::to_string);
        managers
            .audit
            .log_response(Some(&auth), &req, resp.as_ref(), err_str.as_deref())
            .await
            .map_err(|e| {
                error!(error = %e, path = %req.path, "failed to audit response");
                CoreError::Internal
            })?;

        match route_err {
            None => Ok(resp.unwrap_or_default()),
            Some(e) => Err(classify_route_error(e)),
        }
    }

    async fn handle_login(
        &self,
        managers: &Managers,
        req: &Request,
    ) -> Result<Response, CoreError> {
        // No auth is available on login requests.
        managers.audit.log_request(None, req).await.map_err(|e| {
            error!(error = %e, path = %req.path, "failed to audit request");
            CoreError::Internal
        })?;

        let mut req = req.clone();
        let (mut resp, route_err) = split_route_result(self.router.route(&req).await);

        let mut audit_auth = None;
        if let Some(resp) = resp.as_mut() {
            if let Some(auth) = resp.auth.as_mut() {
                // Derive the display name from the credential mount.
                let source = self
                    .router
                    .matching_mount(&req.path)
                    .await
                    .unwrap_or_default();
                let source = source
                    .strip_prefix(CREDENTIAL_ROUTE_PREFIX)
                    .unwrap_or(&source)
                    .replace('/', "-");
                let display_name = format!("{source}{}", auth.display_name)
                    .trim_end_matches('-')
                    .to_owned();
                auth.display_name = display_name.clone();

                let mut entry = TokenEntry {
                    id: String::new(),
                    parent_id: None,
                    policies: auth.policies.clone(),
                    metadata: auth.metadata.clone(),
                    display_name: display_name.clone(),
                    num_uses: None,
                    path: req.path.clone(),
                };
                managers.tokens.create(&mut entry).await.map_err(|e| {
                    error!(error = %e, "failed to create login token");
                    CoreError::Internal
                })?;
                auth.client_token = entry.id;

                let root_holder = auth.policies.iter().any(|p| p == "root");
                if auth.lease_duration.is_zero() && !root_holder {
                    auth.lease_duration = self.default_lease;
                }
                if auth.lease_duration > self.max_lease {
                    auth.lease_duration = self.max_lease;
                }
                if !root_holder {
                    managers
                        .expiration
                        .register_auth(&req.path, auth)
                        .await
                        .map_err(|e| {
                            error!(error = %e, "failed to register login token lease");
                            CoreError::Internal
                        })?;
                }

                req.display_name = display_name;
                audit_auth = Some(auth.clone());
            }
        }

        let err_str = route_err.as_ref().map(ToString::to_string);
        managers
            .audit
            .log_response(audit_auth.as_ref(), &req, resp.as_ref(), err_str.as_deref())
            .await
            .map_err(|e| {
                error!(error = %e, path = %req.path, "failed to audit response");
                CoreError::Internal
            })?;

        match route_err {
            None => Ok(resp.unwrap_or_default()),
            Some(e) => Err(classify_route_error(e)),
        }
    }

    /// Validate a token and its ACL for an operation on a path,
    /// synthesizing the auth context on success.
    async fn check_token(
        &self,
        managers: &Managers,
        op: Operation,
        path: &str,
        token: &str,
    ) -> Result<Auth, CoreError> {
        if token.is_empty() {
            return Err(CoreError::PermissionDenied);
        }

        let entry = managers.tokens.lookup(token).await.map_err(|e| {
            error!(error = %e, "failed to lookup token");
            CoreError::Internal
        })?;
        let Some(mut entry) = entry else {
            return Err(CoreError::PermissionDenied);
        };

        managers.tokens.use_token(&mut entry).await.map_err(|e| {
            error!(error = %e, "failed to use token");
            CoreError::Internal
        })?;

        let acl = managers.policy.acl(&entry.policies).await.map_err(|e| {
            error!(error = %e, "failed to construct ACL");
            CoreError::Internal
        })?;

        if self.router.root_path(path).await && !acl.root_privilege(path) {
            return Err(CoreError::PermissionDenied);
        }
        if !acl.allow_operation(op, path) {
            return Err(CoreError::PermissionDenied);
        }

        Ok(Auth {
            client_token: token.to_owned(),
            policies: entry.policies,
            metadata: entry.metadata,
            display_name: entry.display_name,
            lease_duration: Duration::zero(),
            renewable: false,
        })
    }

    // ── leadership ───────────────────────────────────────────────────

    /// Whether this node is the leader, and the leader's advertised
    /// address.
    ///
    /// On the active node returns `(true, own address)`. On a standby the
    /// current holder's advertisement is read from inside the barrier.
    ///
    /// # Errors
    ///
    /// - [`CoreError::HaNotEnabled`] without an HA backend.
    /// - [`CoreError::Sealed`] while sealed.
    pub async fn leader(&self) -> Result<(bool, String), CoreError> {
        let state = self.state.read().await;
        if !self.ha_enabled {
            return Err(CoreError::HaNotEnabled);
        }
        if state.sealed {
            return Err(CoreError::Sealed);
        }
        if !state.standby {
            return Ok((true, self.advertise_addr.clone()));
        }

        let Some(ha) = self.physical.ha() else {
            return Err(CoreError::Internal);
        };
        let lock = ha.lock_with(CORE_LOCK_PATH, "read").map_err(|e| {
            error!(error = %e, "failed to create lock handle");
            CoreError::Internal
        })?;
        let (held, value) = lock.value().await.map_err(|e| {
            error!(error = %e, "failed to read lock value");
            CoreError::Internal
        })?;
        if !held {
            return Ok((false, String::new()));
        }

        let entry = self
            .barrier
            .get(&format!("{CORE_LEADER_PREFIX}{value}"))
            .await
            .map_err(|e| {
                error!(error = %e, "failed to read leader advertisement");
                CoreError::Internal
            })?;
        match entry {
            None => Ok((false, String::new())),
            Some(raw) => {
                let addr = String::from_utf8(raw).map_err(|_| CoreError::Internal)?;
                Ok((false, addr))
            }
        }
    }

    /// The standby loop: win the lock, promote, serve until leadership is
    /// lost or a stop is requested, demote, repeat.
    async fn run_standby(
        self: Arc<Self>,
        mut stop: watch::Receiver<bool>,
        done_tx: oneshot::Sender<()>,
    ) {
        info!("entering standby mode");
        loop {
            if *stop.borrow() {
                break;
            }

            let uuid = Uuid::new_v4().to_string();
            let Some(ha) = self.physical.ha() else {
                error!("standby loop without an HA backend");
                break;
            };
            let lock = match ha.lock_with(CORE_LOCK_PATH, &uuid) {
                Ok(lock) => lock,
                Err(e) => {
                    error!(error = %e, "failed to create lock");
                    break;
                }
            };

            let Some(leader_lost) = self.acquire_lock(lock.as_ref(), &stop).await else {
                break;
            };
            info!("acquired lock, enabling active operation");

            if let Err(e) = self.advertise_leader(&uuid).await {
                error!(error = %e, "leader advertisement setup failed");
                let _ = lock.release().await;
                continue;
            }

            // Promote under the state lock; release it before waiting on
            // the leader signal to avoid deadlocking with seal.
            let promoted = {
                let mut state = self.state.write().await;
                match self.post_unseal().await {
                    Ok(()) => {
                        state.standby = false;
                        true
                    }
                    Err(e) => {
                        error!(error = %e, "post-unseal setup failed");
                        false
                    }
                }
            };
            if !promoted {
                let _ = self.clear_leader(&uuid).await;
                let _ = lock.release().await;
                continue;
            }

            tokio::select! {
                _ = leader_lost => {
                    warn!("leadership lost, stopping active operation");
                }
                _ = stop.changed() => {
                    warn!("stopping active operation");
                }
            }

            if let Err(e) = self.clear_leader(&uuid).await {
                error!(error = %e, "clearing leader advertisement failed");
            }

            // Exactly one demotion per active→standby transition.
            {
                let mut state = self.state.write().await;
                state.standby = true;
                if let Err(e) = self.pre_seal().await {
                    error!(error = %e, "pre-seal teardown failed");
                }
            }

            let _ = lock.release().await;
        }

        info!("leaving standby mode");
        let _ = done_tx.send(());
    }

    /// Block until the lock is held, retrying on error, or until `stop`
    /// fires.
    async fn acquire_lock(
        &self,
        lock: &dyn AdvisoryLock,
        stop: &watch::Receiver<bool>,
    ) -> Option<LeaderLost> {
        loop {
            if *stop.borrow() {
                return None;
            }
            match lock.acquire(stop.clone()).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    error!(error = %e, "failed to acquire lock");
                    let mut stop_retry = stop.clone();
                    tokio::select! {
                        () = tokio::time::sleep(LOCK_RETRY_INTERVAL) => {}
                        _ = stop_retry.changed() => return None,
                    }
                }
            }
        }
    }

    /// Write our advertisement inside the barrier, readable only by other
    /// unsealed nodes.
    async fn advertise_leader(&self, uuid: &str) -> Result<(), CoreError> {
        self.barrier
            .put(
                &format!("{CORE_LEADER_PREFIX}{uuid}"),
                self.advertise_addr.as_bytes(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, "failed to write leader advertisement");
                CoreError::Internal
            })
    }

    async fn clear_leader(&self, uuid: &str) -> Result<(), CoreError> {
        self.barrier
            .delete(&format!("{CORE_LEADER_PREFIX}{uuid}"))
            .await
            .map_err(|e| {
                error!(error = %e, "failed to clear leader advertisement");
                CoreError::Internal
            })
    }

    // ── bring-up / tear-down ─────────────────────────────────────────

    /// Strictly-ordered bring-up after the barrier is unsealed: cache
    /// purge, logical mounts, rollback, policy store, credential mounts,
    /// expiration, audits, metrics. Every step failure is fatal; the
    /// caller re-seals the barrier.
    async fn post_unseal(&self) -> Result<(), CoreError> {
        info!("post-unseal setup starting");

        if let Some(cache) = &self.cache {
            cache.purge();
        }

        let logical_mounts = match self.setup_logical_mounts().await {
            Ok(table) => table,
            Err(e) => {
                self.router.unmount_all().await;
                return Err(e);
            }
        };

        let rollback = Arc::new(crate::rollback::RollbackManager::start(
            Arc::clone(&self.router),
            Arc::clone(&logical_mounts),
        ));

        let rest = self.setup_remaining().await;
        let (policy, credential_mounts, tokens, expiration, audit_mounts, audit) = match rest {
            Ok(parts) => parts,
            Err(e) => {
                rollback.stop().await;
                self.router.unmount_all().await;
                return Err(e);
            }
        };

        // Background tasks start only once every setup step has
        // succeeded, so a failed bring-up leaves nothing running.
        let (exp_stop_tx, exp_stop_rx) = watch::channel(false);
        let expiration_task = Arc::new(StopHandle::new(
            exp_stop_tx,
            expiration.start(exp_stop_rx),
        ));

        let (metrics_stop_tx, metrics_stop_rx) = watch::channel(false);
        let metrics_task = Arc::new(StopHandle::new(
            metrics_stop_tx,
            spawn_metrics(Arc::clone(&expiration), metrics_stop_rx),
        ));

        *self.managers.write().await = Some(Managers {
            logical_mounts,
            credential_mounts,
            audit_mounts,
            policy,
            tokens,
            expiration,
            audit,
            rollback,
            expiration_task,
            metrics_task,
        });

        info!("post-unseal setup complete");
        Ok(())
    }

    /// Load the logical mount table and mount every entry on the router.
    async fn setup_logical_mounts(&self) -> Result<Arc<Mutex<MountTable>>, CoreError> {
        let table = MountTable::load(&self.barrier, CORE_MOUNTS_PATH, MountTable::default_logical)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to load mount table");
                CoreError::Internal
            })?;
        table
            .persist(&self.barrier, CORE_MOUNTS_PATH)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to persist mount table");
                CoreError::Internal
            })?;

        for entry in &table.entries {
            let backend = self.build_logical_backend(entry)?;
            let view = Arc::new(BarrierView::new(
                Arc::clone(&self.barrier),
                format!("logical/{}/", entry.uuid),
            ));
            self.router
                .mount(entry.path.clone(), backend, view)
                .await
                .map_err(|e| {
                    error!(error = %e, path = %entry.path, "failed to mount backend");
                    CoreError::Internal
                })?;
        }

        Ok(Arc::new(Mutex::new(table)))
    }

    /// Policy store, credential mounts, expiration manager, and audits,
    /// in bring-up order.
    #[allow(clippy::type_complexity)]
    async fn setup_remaining(
        &self,
    ) -> Result<
        (
            Arc<PolicyStore>,
            Arc<Mutex<MountTable>>,
            Arc<TokenStore>,
            Arc<ExpirationManager>,
            Arc<Mutex<MountTable>>,
            Arc<AuditBroker>,
        ),
        CoreError,
    > {
        let policy = Arc::new(PolicyStore::new(Arc::new(BarrierView::new(
            Arc::clone(&self.barrier),
            "sys/policy/",
        ))));

        let (credential_mounts, tokens) = self.setup_credential_mounts().await?;

        let expiration = Arc::new(ExpirationManager::new(
            Arc::new(BarrierView::new(Arc::clone(&self.barrier), "sys/expire/")),
            Arc::clone(&self.router),
            Arc::clone(&tokens),
            self.max_lease,
        ));
        expiration.restore().await.map_err(|e| {
            error!(error = %e, "failed to restore leases");
            CoreError::Internal
        })?;

        let (audit_mounts, audit) = self.setup_audit_mounts().await?;

        Ok((policy, credential_mounts, tokens, expiration, audit_mounts, audit))
    }

    /// Load the credential table and mount every entry under `auth/`.
    async fn setup_credential_mounts(
        &self,
    ) -> Result<(Arc<Mutex<MountTable>>, Arc<TokenStore>), CoreError> {
        let table = MountTable::load(&self.barrier, CORE_AUTH_PATH, MountTable::default_credential)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to load credential table");
                CoreError::Internal
            })?;
        table
            .persist(&self.barrier, CORE_AUTH_PATH)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to persist credential table");
                CoreError::Internal
            })?;

        let mut token_store = None;
        for entry in &table.entries {
            let view = Arc::new(BarrierView::new(
                Arc::clone(&self.barrier),
                format!("auth/{}/", entry.uuid),
            ));
            let backend: Arc<dyn Backend> = if entry.backend_type == "token" {
                let store = Arc::new(TokenStore::new(Arc::clone(&view)));
                token_store = Some(Arc::clone(&store));
                store
            } else {
                let factory = self
                    .credential_factories
                    .get(&entry.backend_type)
                    .ok_or_else(|| {
                        error!(backend_type = %entry.backend_type, "unknown credential backend");
                        CoreError::Internal
                    })?;
                factory(Arc::clone(&view)).map_err(|e| {
                    error!(error = %e, backend_type = %entry.backend_type, "credential factory failed");
                    CoreError::Internal
                })?
            };

            self.router
                .mount(
                    format!("{CREDENTIAL_ROUTE_PREFIX}{}", entry.path),
                    backend,
                    view,
                )
                .await
                .map_err(|e| {
                    error!(error = %e, path = %entry.path, "failed to mount credential backend");
                    CoreError::Internal
                })?;
        }

        let tokens = token_store.ok_or_else(|| {
            error!("credential table has no token store");
            CoreError::Internal
        })?;
        Ok((Arc::new(Mutex::new(table)), tokens))
    }

    /// Load the audit table and register every sink with a fresh broker.
    async fn setup_audit_mounts(
        &self,
    ) -> Result<(Arc<Mutex<MountTable>>, Arc<AuditBroker>), CoreError> {
        let table = MountTable::load(&self.barrier, CORE_AUDIT_PATH, MountTable::default_audit)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to load audit table");
                CoreError::Internal
            })?;
        table
            .persist(&self.barrier, CORE_AUDIT_PATH)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to persist audit table");
                CoreError::Internal
            })?;

        let hmac_key = self.audit_hmac_key().await?;
        let audit = Arc::new(AuditBroker::new(hmac_key));

        for entry in &table.entries {
            let factory = self.audit_factories.get(&entry.backend_type).ok_or_else(|| {
                error!(backend_type = %entry.backend_type, "unknown audit backend");
                CoreError::Internal
            })?;
            let sink = factory(entry).map_err(|e| {
                error!(error = %e, backend_type = %entry.backend_type, "audit factory failed");
                CoreError::Internal
            })?;
            audit.register(entry.path.clone(), sink).await;
        }

        Ok((Arc::new(Mutex::new(table)), audit))
    }

    /// Load the audit HMAC key, creating it on first unseal.
    async fn audit_hmac_key(&self) -> Result<Vec<u8>, CoreError> {
        match self.barrier.get(AUDIT_HMAC_KEY_PATH).await {
            Ok(Some(key)) => Ok(key),
            Ok(None) => {
                let mut key = vec![0u8; 32];
                OsRng.fill_bytes(&mut key);
                self.barrier
                    .put(AUDIT_HMAC_KEY_PATH, &key)
                    .await
                    .map_err(|e| {
                        error!(error = %e, "failed to persist audit HMAC key");
                        CoreError::Internal
                    })?;
                Ok(key)
            }
            Err(e) => {
                error!(error = %e, "failed to read audit HMAC key");
                Err(CoreError::Internal)
            }
        }
    }

    /// Strictly-reverse tear-down: metrics, audits, expiration,
    /// credentials, policy store, rollback, mounts, cache. Tolerates a
    /// partially completed bring-up.
    async fn pre_seal(&self) -> Result<(), CoreError> {
        info!("pre-seal teardown starting");

        let managers = self.managers.write().await.take();
        if let Some(managers) = managers {
            managers.metrics_task.stop().await;
            // Audit sinks and credential/policy stores have no background
            // work; dropping the manager set tears them down.
            managers.expiration_task.stop().await;
            managers.rollback.stop().await;
        }

        self.router.unmount_all().await;
        if let Some(cache) = &self.cache {
            cache.purge();
        }

        info!("pre-seal teardown complete");
        Ok(())
    }

    // ── management surface for the system backend ────────────────────

    pub(crate) async fn managers(&self) -> Result<Managers, CoreError> {
        self.managers
            .read()
            .await
            .clone()
            .ok_or(CoreError::Internal)
    }

    /// Mount a new logical backend at `path`.
    pub(crate) async fn mount_logical(&self, entry: MountEntry) -> Result<(), CoreError> {
        if entry.backend_type == "system" {
            return Err(CoreError::InvalidRequest(
                "cannot mount a second system backend".to_owned(),
            ));
        }
        let managers = self.managers().await?;
        let backend = self.build_logical_backend(&entry)?;
        let view = Arc::new(BarrierView::new(
            Arc::clone(&self.barrier),
            format!("logical/{}/", entry.uuid),
        ));

        let mut table = managers.logical_mounts.lock().await;
        self.router
            .mount(entry.path.clone(), backend, view)
            .await
            .map_err(|e| match e {
                RouteError::MountConflict { path } => {
                    CoreError::InvalidRequest(format!("mount conflict at '{path}'"))
                }
                other => {
                    error!(error = %other, "mount failed");
                    CoreError::Internal
                }
            })?;
        table.entries.push(entry);
        table
            .persist(&self.barrier, CORE_MOUNTS_PATH)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to persist mount table");
                CoreError::Internal
            })?;
        Ok(())
    }

    /// Unmount the logical backend at `path`, revoking its leases first.
    pub(crate) async fn unmount_logical(&self, path: &str) -> Result<(), CoreError> {
        let managers = self.managers().await?;
        let mut table = managers.logical_mounts.lock().await;

        let entry = table.remove(path).ok_or_else(|| {
            CoreError::InvalidRequest(format!("no matching mount at '{path}'"))
        })?;
        if entry.backend_type == "system" {
            table.entries.push(entry);
            return Err(CoreError::InvalidRequest(
                "cannot unmount the system backend".to_owned(),
            ));
        }

        managers
            .expiration
            .revoke_prefix(&entry.path)
            .await
            .map_err(|e| {
                error!(error = %e, path = %entry.path, "failed to revoke leases on unmount");
                CoreError::Internal
            })?;

        self.router.unmount(&entry.path).await.map_err(|e| {
            error!(error = %e, path = %entry.path, "failed to unmount backend");
            CoreError::Internal
        })?;
        table
            .persist(&self.barrier, CORE_MOUNTS_PATH)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to persist mount table");
                CoreError::Internal
            })?;
        Ok(())
    }

    /// Mount a new credential backend under `auth/`.
    pub(crate) async fn mount_credential(&self, entry: MountEntry) -> Result<(), CoreError> {
        if entry.backend_type == "token" {
            return Err(CoreError::InvalidRequest(
                "cannot mount a second token store".to_owned(),
            ));
        }
        let managers = self.managers().await?;
        let factory = self
            .credential_factories
            .get(&entry.backend_type)
            .ok_or_else(|| {
                CoreError::InvalidRequest(format!(
                    "unknown credential backend type '{}'",
                    entry.backend_type
                ))
            })?;
        let view = Arc::new(BarrierView::new(
            Arc::clone(&self.barrier),
            format!("auth/{}/", entry.uuid),
        ));
        let backend = factory(Arc::clone(&view)).map_err(|e| {
            error!(error = %e, backend_type = %entry.backend_type, "credential factory failed");
            CoreError::Internal
        })?;

        let mut table = managers.credential_mounts.lock().await;
        self.router
            .mount(
                format!("{CREDENTIAL_ROUTE_PREFIX}{}", entry.path),
                backend,
                view,
            )
            .await
            .map_err(|e| match e {
                RouteError::MountConflict { path } => {
                    CoreError::InvalidRequest(format!("mount conflict at '{path}'"))
                }
                other => {
                    error!(error = %other, "credential mount failed");
                    CoreError::Internal
                }
            })?;
        table.entries.push(entry);
        table
            .persist(&self.barrier, CORE_AUTH_PATH)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to persist credential table");
                CoreError::Internal
            })?;
        Ok(())
    }

    /// Unmount the credential backend at `path`, revoking its leases.
    pub(crate) async fn unmount_credential(&self, path: &str) -> Result<(), CoreError> {
        let managers = self.managers().await?;
        let mut table = managers.credential_mounts.lock().await;

        let entry = table.remove(path).ok_or_else(|| {
            CoreError::InvalidRequest(format!("no matching credential mount at '{path}'"))
        })?;
        if entry.backend_type == "token" {
            table.entries.push(entry);
            return Err(CoreError::InvalidRequest(
                "cannot unmount the token store".to_owned(),
            ));
        }

        let route_prefix = format!("{CREDENTIAL_ROUTE_PREFIX}{}", entry.path);
        managers
            .expiration
            .revoke_prefix(&route_prefix)
            .await
            .map_err(|e| {
                error!(error = %e, path = %route_prefix, "failed to revoke leases on unmount");
                CoreError::Internal
            })?;

        self.router.unmount(&route_prefix).await.map_err(|e| {
            error!(error = %e, path = %route_prefix, "failed to unmount credential backend");
            CoreError::Internal
        })?;
        table
            .persist(&self.barrier, CORE_AUTH_PATH)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to persist credential table");
                CoreError::Internal
            })?;
        Ok(())
    }

    /// Enable an audit sink at `path`.
    pub(crate) async fn enable_audit(&self, entry: MountEntry) -> Result<(), CoreError> {
        let managers = self.managers().await?;
        let factory = self
            .audit_factories
            .get(&entry.backend_type)
            .ok_or_else(|| {
                CoreError::InvalidRequest(format!(
                    "unknown audit backend type '{}'",
                    entry.backend_type
                ))
            })?;
        let sink = factory(&entry).map_err(|e| {
            error!(error = %e, "audit factory failed");
            CoreError::Internal
        })?;

        let mut table = managers.audit_mounts.lock().await;
        if table.find(&entry.path).is_some() {
            return Err(CoreError::InvalidRequest(format!(
                "audit sink already enabled at '{}'",
                entry.path
            )));
        }
        managers.audit.register(entry.path.clone(), sink).await;
        table.entries.push(entry);
        table
            .persist(&self.barrier, CORE_AUDIT_PATH)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to persist audit table");
                CoreError::Internal
            })?;
        Ok(())
    }

    /// Disable the audit sink at `path`.
    pub(crate) async fn disable_audit(&self, path: &str) -> Result<(), CoreError> {
        let managers = self.managers().await?;
        let mut table = managers.audit_mounts.lock().await;
        let entry = table.remove(path).ok_or_else(|| {
            CoreError::InvalidRequest(format!("no audit sink at '{path}'"))
        })?;
        managers.audit.deregister(&entry.path).await;
        table
            .persist(&self.barrier, CORE_AUDIT_PATH)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to persist audit table");
                CoreError::Internal
            })?;
        Ok(())
    }

    fn build_logical_backend(&self, entry: &MountEntry) -> Result<Arc<dyn Backend>, CoreError> {
        if entry.backend_type == "system" {
            return Ok(Arc::new(SystemBackend::new(self.self_ref.clone())));
        }

        let factory = self
            .logical_factories
            .get(&entry.backend_type)
            .ok_or_else(|| {
                CoreError::InvalidRequest(format!(
                    "unknown backend type '{}'",
                    entry.backend_type
                ))
            })?;
        let view = Arc::new(BarrierView::new(
            Arc::clone(&self.barrier),
            format!("logical/{}/", entry.uuid),
        ));
        factory(view).map_err(|e| {
            error!(error = %e, backend_type = %entry.backend_type, "backend factory failed");
            CoreError::Internal
        })
    }
}

/// Emit expiration gauges once a second while active.
fn spawn_metrics(
    expiration: Arc<ExpirationManager>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
                () = tokio::time::sleep(METRICS_INTERVAL) => {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!("coffer.expire.num_leases")
                        .set(expiration.pending_count() as f64);
                }
            }
        }
    })
}

/// Clamp a requested lease into `[default, max]`; zero means default.
fn clamp_lease(requested: Duration, default: Duration, max: Duration) -> Duration {
    let lease = if requested.is_zero() { default } else { requested };
    lease.min(max)
}

fn split_route_result(
    result: Result<Option<Response>, RouteError>,
) -> (Option<Response>, Option<RouteError>) {
    match result {
        Ok(resp) => (resp, None),
        Err(e) => (None, Some(e)),
    }
}

/// Internal and permission failures propagate as-is; everything else is an
/// invalid request whose message the client may see.
fn classify_route_error(err: RouteError) -> CoreError {
    match err {
        RouteError::NoMount { path } => {
            CoreError::InvalidRequest(format!("no handler for path '{path}'"))
        }
        RouteError::Backend(BackendError::InvalidRequest(msg)) => CoreError::InvalidRequest(msg),
        RouteError::Backend(BackendError::Unsupported { path }) => {
            CoreError::InvalidRequest(format!("unsupported operation on '{path}'"))
        }
        RouteError::MountConflict { .. } | RouteError::NotMounted { .. } => {
            error!(error = %err, "unexpected routing error");
            CoreError::Internal
        }
        RouteError::Backend(other) => {
            error!(error = %other, "backend failure");
            CoreError::Internal
        }
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("ha_enabled", &self.ha_enabled)
            .finish_non_exhaustive()
    }
}
