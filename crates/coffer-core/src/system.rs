//! The `sys/` management backend.
//!
//! Exposes mount, policy, audit, and lease management as ordinary routed
//! requests, so they flow through the same token, ACL, and audit pipeline
//! as every other operation. Management sub-paths are root-protected.
//!
//! The backend needs a handle back to the Core that mounts it; it holds a
//! `Weak` reference established when the Core constructs it during mount
//! setup, keeping the reference cycle breakable.

use std::sync::Weak;

use serde_json::{Map, Value};

use crate::core::Core;
use crate::error::{BackendError, CoreError};
use crate::logical::{Backend, Operation, Request, Response};
use crate::mount::MountEntry;

/// The system backend mounted at `sys/`.
pub struct SystemBackend {
    core: Weak<Core>,
}

impl SystemBackend {
    /// Create a system backend bound to its core.
    #[must_use]
    pub fn new(core: Weak<Core>) -> Self {
        Self { core }
    }

    fn core(&self) -> Result<std::sync::Arc<Core>, BackendError> {
        self.core.upgrade().ok_or_else(|| BackendError::Internal {
            reason: "core has been dropped".to_owned(),
        })
    }
}

#[async_trait::async_trait]
impl Backend for SystemBackend {
    async fn handle_request(&self, req: &Request) -> Result<Option<Response>, BackendError> {
        let path = req.path.as_str();
        match req.operation {
            Operation::Read | Operation::List if path == "mounts" => self.list_mounts().await,
            Operation::Write if path.starts_with("mounts/") => {
                self.mount(&path["mounts/".len()..], req.data.as_ref()).await
            }
            Operation::Delete if path.starts_with("mounts/") => {
                self.unmount(&path["mounts/".len()..]).await
            }
            Operation::Read | Operation::List if path == "policy" => self.list_policies().await,
            Operation::Read if path.starts_with("policy/") => {
                self.read_policy(&path["policy/".len()..]).await
            }
            Operation::Write if path.starts_with("policy/") => {
                self.write_policy(&path["policy/".len()..], req.data.as_ref())
                    .await
            }
            Operation::Delete if path.starts_with("policy/") => {
                self.delete_policy(&path["policy/".len()..]).await
            }
            Operation::Read | Operation::List if path == "auth" => self.list_auth().await,
            Operation::Write if path.starts_with("auth/") => {
                self.enable_auth(&path["auth/".len()..], req.data.as_ref())
                    .await
            }
            Operation::Delete if path.starts_with("auth/") => {
                self.disable_auth(&path["auth/".len()..]).await
            }
            Operation::Read | Operation::List if path == "audit" => self.list_audit().await,
            Operation::Write if path.starts_with("audit/") => {
                self.enable_audit(&path["audit/".len()..], req.data.as_ref())
                    .await
            }
            Operation::Delete if path.starts_with("audit/") => {
                self.disable_audit(&path["audit/".len()..]).await
            }
            Operation::Write if path.starts_with("renew/") => {
                self.renew(&path["renew/".len()..], req.data.as_ref()).await
            }
            Operation::Write if path.starts_with("revoke/") => {
                self.revoke(&path["revoke/".len()..]).await
            }
            Operation::Write if path.starts_with("revoke-prefix/") => {
                self.revoke_prefix(&path["revoke-prefix/".len()..]).await
            }
            Operation::Revoke | Operation::Renew | Operation::Rollback => Ok(None),
            _ => Err(BackendError::Unsupported {
                path: req.path.clone(),
            }),
        }
    }

    fn root_paths(&self) -> Vec<String> {
        [
            "mounts/*",
            "policy",
            "policy/*",
            "auth",
            "auth/*",
            "audit",
            "audit/*",
            "renew/*",
            "revoke/*",
            "revoke-prefix/*",
        ]
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
    }
}

impl SystemBackend {
    async fn list_mounts(&self) -> Result<Option<Response>, BackendError> {
        let core = self.core()?;
        let managers = core.managers().await.map_err(into_backend_error)?;
        let table = managers.logical_mounts.lock().await;

        let mut mounts = Map::new();
        for entry in &table.entries {
            mounts.insert(
                entry.path.clone(),
                serde_json::json!({
                    "type": entry.backend_type,
                    "description": entry.description,
                }),
            );
        }
        Ok(Some(Response::data(Value::Object(mounts))))
    }

    async fn mount(
        &self,
        path: &str,
        data: Option<&Value>,
    ) -> Result<Option<Response>, BackendError> {
        let Some(data) = data else {
            return Err(BackendError::InvalidRequest(
                "missing mount parameters".to_owned(),
            ));
        };
        let backend_type = data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::InvalidRequest("missing backend type".to_owned()))?;
        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let entry = MountEntry::new(path, backend_type, description);
        self.core()?
            .mount_logical(entry)
            .await
            .map_err(into_backend_error)?;
        Ok(None)
    }

    async fn unmount(&self, path: &str) -> Result<Option<Response>, BackendError> {
        let path = ensure_trailing_slash(path);
        self.core()?
            .unmount_logical(&path)
            .await
            .map_err(into_backend_error)?;
        Ok(None)
    }

    async fn list_policies(&self) -> Result<Option<Response>, BackendError> {
        let core = self.core()?;
        let managers = core.managers().await.map_err(into_backend_error)?;
        let names = managers
            .policy
            .list_policies()
            .await
            .map_err(|e| BackendError::Internal {
                reason: e.to_string(),
            })?;
        Ok(Some(Response::data(serde_json::json!({ "policies": names }))))
    }

    async fn read_policy(&self, name: &str) -> Result<Option<Response>, BackendError> {
        let core = self.core()?;
        let managers = core.managers().await.map_err(into_backend_error)?;
        let policy = managers
            .policy
            .get_policy(name)
            .await
            .map_err(|e| BackendError::Internal {
                reason: e.to_string(),
            })?
            .ok_or_else(|| {
                BackendError::InvalidRequest(format!("policy not found: {name}"))
            })?;

        let rules = serde_json::to_value(&policy.rules).map_err(|e| BackendError::Internal {
            reason: e.to_string(),
        })?;
        Ok(Some(Response::data(serde_json::json!({
            "name": policy.name,
            "rules": rules,
        }))))
    }

    async fn write_policy(
        &self,
        name: &str,
        data: Option<&Value>,
    ) -> Result<Option<Response>, BackendError> {
        let Some(data) = data else {
            return Err(BackendError::InvalidRequest(
                "missing policy document".to_owned(),
            ));
        };
        let rules = data
            .get("rules")
            .cloned()
            .ok_or_else(|| BackendError::InvalidRequest("missing policy rules".to_owned()))?;
        let rules = serde_json::from_value(rules)
            .map_err(|e| BackendError::InvalidRequest(format!("invalid policy rules: {e}")))?;

        let core = self.core()?;
        let managers = core.managers().await.map_err(into_backend_error)?;
        managers
            .policy
            .set_policy(&crate::policy::Policy {
                name: name.to_owned(),
                rules,
            })
            .await
            .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;
        Ok(None)
    }

    async fn delete_policy(&self, name: &str) -> Result<Option<Response>, BackendError> {
        let core = self.core()?;
        let managers = core.managers().await.map_err(into_backend_error)?;
        managers
            .policy
            .delete_policy(name)
            .await
            .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;
        Ok(None)
    }

    async fn list_auth(&self) -> Result<Option<Response>, BackendError> {
        let core = self.core()?;
        let managers = core.managers().await.map_err(into_backend_error)?;
        let table = managers.credential_mounts.lock().await;

        let mut mounts = Map::new();
        for entry in &table.entries {
            mounts.insert(
                entry.path.clone(),
                serde_json::json!({
                    "type": entry.backend_type,
                    "description": entry.description,
                }),
            );
        }
        Ok(Some(Response::data(Value::Object(mounts))))
    }

    async fn enable_auth(
        &self,
        path: &str,
        data: Option<&Value>,
    ) -> Result<Option<Response>, BackendError> {
        let Some(data) = data else {
            return Err(BackendError::InvalidRequest(
                "missing auth parameters".to_owned(),
            ));
        };
        let backend_type = data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::InvalidRequest("missing backend type".to_owned()))?;
        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let entry = MountEntry::new(path, backend_type, description);
        self.core()?
            .mount_credential(entry)
            .await
            .map_err(into_backend_error)?;
        Ok(None)
    }

    async fn disable_auth(&self, path: &str) -> Result<Option<Response>, BackendError> {
        let path = ensure_trailing_slash(path);
        self.core()?
            .unmount_credential(&path)
            .await
            .map_err(into_backend_error)?;
        Ok(None)
    }

    async fn list_audit(&self) -> Result<Option<Response>, BackendError> {
        let core = self.core()?;
        let managers = core.managers().await.map_err(into_backend_error)?;
        let table = managers.audit_mounts.lock().await;

        let mut sinks = Map::new();
        for entry in &table.entries {
            sinks.insert(
                entry.path.clone(),
                serde_json::json!({
                    "type": entry.backend_type,
                    "description": entry.description,
                }),
            );
        }
        Ok(Some(Response::data(Value::Object(sinks))))
    }

    async fn enable_audit(
        &self,
        path: &str,
        data: Option<&Value>,
    ) -> Result<Option<Response>, BackendError> {
        let Some(data) = data else {
            return Err(BackendError::InvalidRequest(
                "missing audit parameters".to_owned(),
            ));
        };
        let backend_type = data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::InvalidRequest("missing audit type".to_owned()))?;
        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let entry = MountEntry::new(path, backend_type, description);
        self.core()?
            .enable_audit(entry)
            .await
            .map_err(into_backend_error)?;
        Ok(None)
    }

    async fn disable_audit(&self, path: &str) -> Result<Option<Response>, BackendError> {
        let path = ensure_trailing_slash(path);
        self.core()?
            .disable_audit(&path)
            .await
            .map_err(into_backend_error)?;
        Ok(None)
    }

    async fn renew(
        &self,
        lease_id: &str,
        data: Option<&Value>,
    ) -> Result<Option<Response>, BackendError> {
        let increment = data
            .and_then(|d| d.get("increment"))
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let core = self.core()?;
        let managers = core.managers().await.map_err(into_backend_error)?;
        let entry = managers
            .expiration
            .renew(lease_id, chrono::Duration::seconds(increment))
            .await
            .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;

        Ok(Some(Response::data(serde_json::json!({
            "lease_id": entry.lease_id,
            "lease_duration": entry.lease_duration_secs,
            "renewable": entry.renewable,
        }))))
    }

    async fn revoke(&self, lease_id: &str) -> Result<Option<Response>, BackendError> {
        let core = self.core()?;
        let managers = core.managers().await.map_err(into_backend_error)?;
        managers
            .expiration
            .revoke(lease_id)
            .await
            .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;
        Ok(None)
    }

    async fn revoke_prefix(&self, prefix: &str) -> Result<Option<Response>, BackendError> {
        let core = self.core()?;
        let managers = core.managers().await.map_err(into_backend_error)?;
        let revoked = managers
            .expiration
            .revoke_prefix(prefix)
            .await
            .map_err(|e| BackendError::Internal {
                reason: e.to_string(),
            })?;
        Ok(Some(Response::data(serde_json::json!({
            "revoked": revoked,
        }))))
    }
}

fn ensure_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_owned()
    } else {
        format!("{path}/")
    }
}

fn into_backend_error(err: CoreError) -> BackendError {
    match err {
        CoreError::InvalidRequest(msg) => BackendError::InvalidRequest(msg),
        other => BackendError::Internal {
            reason: other.to_string(),
        },
    }
}
