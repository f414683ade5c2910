//! Audit broker.
//!
//! Fans request and response events out to every registered audit sink.
//! Requests are logged *before* routing and responses *after*; if any sink
//! fails to record an event, the broker errors and the Core rejects the
//! request, because unaudited operations must not proceed.
//!
//! Token ids are HMAC-SHA256'd with a per-broker key before they reach a
//! sink, so audit trails correlate without exposing usable credentials.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::AuditError;
use crate::logical::{Auth, Request, Response};

type HmacSha256 = Hmac<Sha256>;

/// Which side of the pipeline an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStage {
    Request,
    Response,
}

/// Authentication context of an audit event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditAuth {
    /// HMAC of the client token.
    pub token_hmac: String,
    pub policies: Vec<String>,
    pub display_name: String,
}

/// A single audit event delivered to every sink.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub stage: AuditStage,
    pub auth: Option<AuditAuth>,
    pub operation: String,
    pub path: String,
    /// Error string on failed responses.
    pub error: Option<String>,
}

/// A registered audit destination.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// Record an event. Must not silently drop it.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be durably recorded.
    async fn log(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Fans audit events out to the registered sinks, fail-closed.
pub struct AuditBroker {
    sinks: RwLock<Vec<(String, Arc<dyn AuditSink>)>>,
    hmac_key: Vec<u8>,
}

impl AuditBroker {
    /// Create a broker with the given HMAC key for sensitive fields.
    #[must_use]
    pub fn new(hmac_key: Vec<u8>) -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
            hmac_key,
        }
    }

    /// Register a sink under a name.
    pub async fn register(&self, name: impl Into<String>, sink: Arc<dyn AuditSink>) {
        self.sinks.write().await.push((name.into(), sink));
    }

    /// Remove the sink with the given name.
    pub async fn deregister(&self, name: &str) {
        self.sinks.write().await.retain(|(n, _)| n != name);
    }

    /// Whether any sinks are registered.
    pub async fn has_sinks(&self) -> bool {
        !self.sinks.read().await.is_empty()
    }

    /// Record a request before it is routed.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::SinkFailure`] if any sink fails.
    pub async fn log_request(
        &self,
        auth: Option<&Auth>,
        req: &Request,
    ) -> Result<(), AuditError> {
        let event = self.build_event(AuditStage::Request, auth, req, None);
        self.dispatch(&event).await
    }

    /// Record the outcome of a request after routing.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::SinkFailure`] if any sink fails.
    pub async fn log_response(
        &self,
        auth: Option<&Auth>,
        req: &Request,
        _resp: Option<&Response>,
        error: Option<&str>,
    ) -> Result<(), AuditError> {
        let event = self.build_event(AuditStage::Response, auth, req, error);
        self.dispatch(&event).await
    }

    /// HMAC a sensitive field for safe inclusion in audit trails.
    #[must_use]
    pub fn hmac_field(&self, value: &str) -> String {
        // HMAC-SHA256 accepts any key length per RFC 2104, so
        // new_from_slice never fails.
        #[allow(clippy::unwrap_used)]
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key).unwrap();
        mac.update(value.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn build_event(
        &self,
        stage: AuditStage,
        auth: Option<&Auth>,
        req: &Request,
        error: Option<&str>,
    ) -> AuditEvent {
        AuditEvent {
            timestamp: Utc::now(),
            stage,
            auth: auth.map(|a| AuditAuth {
                token_hmac: self.hmac_field(&a.client_token),
                policies: a.policies.clone(),
                display_name: a.display_name.clone(),
            }),
            operation: format!("{:?}", req.operation).to_lowercase(),
            path: req.path.clone(),
            error: error.map(str::to_owned),
        }
    }

    async fn dispatch(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let sinks = self.sinks.read().await;
        for (name, sink) in sinks.iter() {
            if let Err(e) = sink.log(event).await {
                warn!(sink = %name, error = %e, "audit sink failed");
                return Err(AuditError::SinkFailure {
                    name: name.clone(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AuditBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditBroker")
            .field("hmac_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}
