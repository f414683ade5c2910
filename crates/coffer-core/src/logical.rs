//! The logical request/response model.
//!
//! Requests flow from the Core through the router into mounted backends.
//! Backends are storage-isolated behind a [`BarrierView`](crate::view::BarrierView)
//! and communicate leases and authentications back to the Core through the
//! [`Secret`] and [`Auth`] blocks on their responses; they never talk to the
//! expiration manager or token store directly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;

use crate::error::BackendError;

/// The operation kind of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Read a value.
    Read,
    /// Write or update a value.
    Write,
    /// Delete a value.
    Delete,
    /// List keys under a prefix.
    List,
    /// Revoke a previously issued secret (internal, driven by the
    /// expiration manager).
    Revoke,
    /// Renew a previously issued secret (internal).
    Renew,
    /// Roll back partial state (internal, driven by the rollback manager).
    Rollback,
}

/// A request into the Core or a routed backend.
///
/// The router rewrites `path` to be relative to the matched mount before
/// the backend sees it.
#[derive(Debug, Clone)]
pub struct Request {
    pub operation: Operation,
    pub path: String,
    pub data: Option<Value>,
    /// Token presented by the caller; empty on login paths.
    pub client_token: String,
    /// Set by the Core after token validation, for audit trails.
    pub display_name: String,
}

impl Request {
    /// Create a request with no body and no token.
    #[must_use]
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            data: None,
            client_token: String::new(),
            display_name: String::new(),
        }
    }

    /// Attach a request body.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach the caller's token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.client_token = token.into();
        self
    }
}

/// Lease information attached to a response carrying secret material.
#[derive(Debug, Clone)]
pub struct Secret {
    /// Assigned by the Core once the lease is registered.
    pub lease_id: String,
    /// Requested validity; zero means "use the default".
    pub lease_duration: Duration,
    pub renewable: bool,
    /// Backend-private data replayed on the revoke hook.
    pub internal_data: Option<Value>,
}

impl Secret {
    /// A secret with the given requested duration and no internal data.
    #[must_use]
    pub fn with_duration(lease_duration: Duration) -> Self {
        Self {
            lease_id: String::new(),
            lease_duration,
            renewable: true,
            internal_data: None,
        }
    }
}

/// Authentication information returned by credential backends.
#[derive(Debug, Clone)]
pub struct Auth {
    /// Populated by the Core once a token entry is minted.
    pub client_token: String,
    pub policies: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub display_name: String,
    /// Requested validity; zero means "use the default".
    pub lease_duration: Duration,
    pub renewable: bool,
}

/// A response from a routed backend.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub data: Option<Value>,
    pub secret: Option<Secret>,
    pub auth: Option<Auth>,
}

impl Response {
    /// A response carrying only data.
    #[must_use]
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }
}

/// A mounted backend serving requests under a path prefix.
///
/// `login_paths` and `root_paths` are patterns relative to the mount:
/// exact, or prefix when ending in `*`. Login paths are reachable without
/// a token; root paths additionally require root privilege from the ACL.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Serve a request whose path is relative to the mount point.
    ///
    /// Returning `Ok(None)` means the operation succeeded with no content.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] on malformed requests or storage failures.
    async fn handle_request(&self, req: &Request) -> Result<Option<Response>, BackendError>;

    /// Sub-paths served without authentication.
    fn login_paths(&self) -> Vec<String> {
        Vec::new()
    }

    /// Sub-paths requiring root privilege.
    fn root_paths(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Factory for logical and credential backends. Receives the mount's
/// storage view.
pub type BackendFactory = Arc<
    dyn Fn(Arc<crate::view::BarrierView>) -> Result<Arc<dyn Backend>, BackendError>
        + Send
        + Sync,
>;

/// Factory for audit sinks. Receives the audit mount entry for its options.
pub type AuditFactory = Arc<
    dyn Fn(&crate::mount::MountEntry) -> Result<Arc<dyn crate::audit::AuditSink>, crate::error::AuditError>
        + Send
        + Sync,
>;

/// Match a path against a pattern: exact, or prefix when the pattern ends
/// in `*`.
#[must_use]
pub(crate) fn pattern_match(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_exactly() {
        assert!(pattern_match("login", "login"));
        assert!(!pattern_match("login", "login/extra"));
        assert!(!pattern_match("login", "log"));
    }

    #[test]
    fn star_pattern_matches_prefix() {
        assert!(pattern_match("mounts/*", "mounts/secret/"));
        assert!(pattern_match("policy*", "policy"));
        assert!(pattern_match("policy*", "policy/dev"));
        assert!(!pattern_match("mounts/*", "policy"));
    }

    #[test]
    fn request_builders_compose() {
        let req = Request::new(Operation::Write, "secret/foo")
            .with_data(serde_json::json!({"v": 1}))
            .with_token("tok");
        assert_eq!(req.operation, Operation::Write);
        assert_eq!(req.path, "secret/foo");
        assert_eq!(req.client_token, "tok");
        assert!(req.data.is_some());
    }
}
