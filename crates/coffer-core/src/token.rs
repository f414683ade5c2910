//! Token store.
//!
//! Tokens are the sole authentication handle the Core understands. Every
//! token is an opaque 128-bit id mapped to a [`TokenEntry`] stored under a
//! dedicated barrier view. The store doubles as the credential backend
//! mounted at `auth/token/`, which is the only backend allowed to return
//! an auth block on a non-login path.
//!
//! Revoking a token revokes its entire child tree, so credentials minted
//! by a compromised token die with it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{BackendError, TokenError};
use crate::logical::{Auth, Backend, Operation, Request, Response};
use crate::view::BarrierView;

/// View sub-prefix for token entries.
const LOOKUP_PREFIX: &str = "id/";

/// View sub-prefix for the parent→child index.
const PARENT_PREFIX: &str = "parent/";

/// A stored token entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    /// Opaque 128-bit id rendered as a stable string.
    pub id: String,
    /// Parent token, if any; revoked together with the parent.
    pub parent_id: Option<String>,
    /// Policy names compiled into an ACL on each request.
    pub policies: Vec<String>,
    pub metadata: HashMap<String, String>,
    /// Shown in audit trails.
    pub display_name: String,
    /// Remaining uses; `None` means unlimited. The entry is deleted when
    /// this reaches zero.
    pub num_uses: Option<u32>,
    /// Request path that created the token.
    pub path: String,
}

impl TokenEntry {
    /// Whether this entry carries the root policy.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.policies.iter().any(|p| p == "root")
    }
}

/// Creates, looks up, consumes, and revokes tokens.
pub struct TokenStore {
    view: Arc<BarrierView>,
}

impl TokenStore {
    /// Create a token store over its dedicated view.
    #[must_use]
    pub fn new(view: Arc<BarrierView>) -> Self {
        Self { view }
    }

    /// Mint the root token. Only called during initialization.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] if persisting the entry fails.
    pub async fn root_token(&self) -> Result<TokenEntry, TokenError> {
        let mut entry = TokenEntry {
            id: String::new(),
            parent_id: None,
            policies: vec!["root".to_owned()],
            metadata: HashMap::new(),
            display_name: "root".to_owned(),
            num_uses: None,
            path: "auth/token/root".to_owned(),
        };
        self.create(&mut entry).await?;
        Ok(entry)
    }

    /// Persist a new token entry, assigning an id if none is set.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] if persisting fails.
    pub async fn create(&self, entry: &mut TokenEntry) -> Result<(), TokenError> {
        if entry.id.is_empty() {
            entry.id = Uuid::new_v4().to_string();
        }
        self.persist(entry).await?;

        if let Some(parent) = &entry.parent_id {
            let index_key = format!("{PARENT_PREFIX}{parent}/{}", entry.id);
            self.view.put(&index_key, b"1").await?;
        }

        info!(display_name = %entry.display_name, "token created");
        Ok(())
    }

    /// Look up a token by id.
    ///
    /// Returns `Ok(None)` for unknown or revoked tokens.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] on storage or decode failure.
    pub async fn lookup(&self, id: &str) -> Result<Option<TokenEntry>, TokenError> {
        let key = format!("{LOOKUP_PREFIX}{id}");
        match self.view.get(&key).await? {
            None => Ok(None),
            Some(raw) => {
                let entry =
                    serde_json::from_slice(&raw).map_err(|e| TokenError::Serialization {
                        reason: e.to_string(),
                    })?;
                Ok(Some(entry))
            }
        }
    }

    /// Consume one use of the token.
    ///
    /// Unlimited tokens are untouched. Limited tokens are decremented and
    /// deleted once the count reaches zero; the request that spent the
    /// final use still proceeds.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] if persisting or deleting fails.
    pub async fn use_token(&self, entry: &mut TokenEntry) -> Result<(), TokenError> {
        let Some(remaining) = entry.num_uses else {
            return Ok(());
        };

        if remaining <= 1 {
            entry.num_uses = Some(0);
            self.revoke(&entry.id).await
        } else {
            entry.num_uses = Some(remaining - 1);
            self.persist(entry).await
        }
    }

    /// Revoke a single token.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] if deletion fails.
    pub async fn revoke(&self, id: &str) -> Result<(), TokenError> {
        if let Some(entry) = self.lookup(id).await? {
            if let Some(parent) = &entry.parent_id {
                let index_key = format!("{PARENT_PREFIX}{parent}/{id}");
                self.view.delete(&index_key).await?;
            }
        }
        self.view.delete(&format!("{LOOKUP_PREFIX}{id}")).await?;
        info!("token revoked");
        Ok(())
    }

    /// Revoke a token and, recursively, every descendant.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] if any deletion fails.
    pub async fn revoke_tree(&self, id: &str) -> Result<(), TokenError> {
        let children_prefix = format!("{PARENT_PREFIX}{id}/");
        let children = self.view.list(&children_prefix).await?;

        for index_key in &children {
            if let Some(child_id) = index_key.strip_prefix(&children_prefix) {
                Box::pin(self.revoke_tree(child_id)).await?;
            }
            self.view.delete(index_key).await?;
        }

        self.revoke(id).await
    }

    async fn persist(&self, entry: &TokenEntry) -> Result<(), TokenError> {
        let raw = serde_json::to_vec(entry).map_err(|e| TokenError::Serialization {
            reason: e.to_string(),
        })?;
        let key = format!("{LOOKUP_PREFIX}{}", entry.id);
        self.view.put(&key, &raw).await?;
        Ok(())
    }
}

/// Body of an `auth/token/create` request.
#[derive(Debug, Deserialize)]
struct CreateTokenRequest {
    #[serde(default)]
    policies: Vec<String>,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    num_uses: Option<u32>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    /// Requested lease in seconds; zero means "use the default".
    #[serde(default)]
    lease: i64,
}

#[async_trait::async_trait]
impl Backend for TokenStore {
    async fn handle_request(&self, req: &Request) -> Result<Option<Response>, BackendError> {
        match (req.operation, req.path.as_str()) {
            (Operation::Write, "create") => self.handle_create(req).await,
            (Operation::Read, path) if path.starts_with("lookup/") => {
                self.handle_lookup(&path["lookup/".len()..]).await
            }
            (Operation::Write, path) if path.starts_with("revoke/") => {
                let id = &path["revoke/".len()..];
                self.revoke_tree(id)
                    .await
                    .map_err(|e| BackendError::Internal {
                        reason: e.to_string(),
                    })?;
                Ok(None)
            }
            (Operation::Revoke | Operation::Renew | Operation::Rollback, _) => Ok(None),
            _ => Err(BackendError::Unsupported {
                path: req.path.clone(),
            }),
        }
    }
}

impl TokenStore {
    async fn handle_create(&self, req: &Request) -> Result<Option<Response>, BackendError> {
        let body: CreateTokenRequest = match &req.data {
            Some(data) => serde_json::from_value(data.clone())
                .map_err(|e| BackendError::InvalidRequest(format!("invalid token request: {e}")))?,
            None => {
                return Err(BackendError::InvalidRequest(
                    "missing token parameters".to_owned(),
                ))
            }
        };

        if body.policies.is_empty() {
            return Err(BackendError::InvalidRequest(
                "token must carry at least one policy".to_owned(),
            ));
        }

        let mut entry = TokenEntry {
            id: String::new(),
            parent_id: Some(req.client_token.clone()),
            policies: body.policies.clone(),
            metadata: body.metadata.clone(),
            display_name: body.display_name.clone(),
            num_uses: body.num_uses,
            path: "auth/token/create".to_owned(),
        };
        self.create(&mut entry)
            .await
            .map_err(|e| BackendError::Internal {
                reason: e.to_string(),
            })?;

        Ok(Some(Response {
            data: None,
            secret: None,
            auth: Some(Auth {
                client_token: entry.id,
                policies: body.policies,
                metadata: body.metadata,
                display_name: body.display_name,
                lease_duration: chrono::Duration::seconds(body.lease),
                renewable: true,
            }),
        }))
    }

    async fn handle_lookup(&self, id: &str) -> Result<Option<Response>, BackendError> {
        let entry = self
            .lookup(id)
            .await
            .map_err(|e| BackendError::Internal {
                reason: e.to_string(),
            })?
            .ok_or_else(|| BackendError::InvalidRequest("token not found".to_owned()))?;

        Ok(Some(Response::data(serde_json::json!({
            "id": entry.id,
            "policies": entry.policies,
            "display_name": entry.display_name,
            "num_uses": entry.num_uses,
            "path": entry.path,
            "metadata": entry.metadata,
        }))))
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}
