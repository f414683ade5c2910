//! Generic (passthrough) secret backend.
//!
//! Stores request bodies as JSON documents under its view and hands them
//! back on read, wrapped in a secret so the Core registers a lease. The
//! requested lease comes from an optional integer `lease` field (seconds)
//! in the stored document; zero lets the Core apply its default. There is
//! no external state, so the revoke hook only has the lease record itself
//! to forget.

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;

use crate::error::BackendError;
use crate::logical::{Backend, Operation, Request, Response, Secret};
use crate::view::BarrierView;

/// Key-value passthrough backend over a barrier view.
#[derive(Debug)]
pub struct PassthroughBackend {
    view: Arc<BarrierView>,
}

impl PassthroughBackend {
    /// Create a passthrough backend over its mount view.
    #[must_use]
    pub fn new(view: Arc<BarrierView>) -> Self {
        Self { view }
    }

    async fn read(&self, path: &str) -> Result<Option<Response>, BackendError> {
        let Some(raw) = self.view.get(path).await? else {
            return Err(BackendError::InvalidRequest(format!(
                "no value at '{path}'"
            )));
        };

        let data: Value = serde_json::from_slice(&raw).map_err(|e| BackendError::Internal {
            reason: format!("stored value corrupt: {e}"),
        })?;

        let lease_secs = data.get("lease").and_then(Value::as_i64).unwrap_or(0);

        Ok(Some(Response {
            data: Some(data),
            secret: Some(Secret::with_duration(Duration::seconds(lease_secs))),
            auth: None,
        }))
    }

    async fn write(&self, path: &str, data: Option<&Value>) -> Result<Option<Response>, BackendError> {
        let Some(data) = data else {
            return Err(BackendError::InvalidRequest(
                "missing data to write".to_owned(),
            ));
        };

        let raw = serde_json::to_vec(data).map_err(|e| BackendError::InvalidRequest(format!(
            "unencodable data: {e}"
        )))?;
        self.view.put(path, &raw).await?;
        Ok(None)
    }

    async fn delete(&self, path: &str) -> Result<Option<Response>, BackendError> {
        self.view.delete(path).await?;
        Ok(None)
    }

    async fn list(&self, path: &str) -> Result<Option<Response>, BackendError> {
        let keys = self.view.list(path).await?;
        Ok(Some(Response::data(serde_json::json!({ "keys": keys }))))
    }
}

#[async_trait::async_trait]
impl Backend for PassthroughBackend {
    async fn handle_request(&self, req: &Request) -> Result<Option<Response>, BackendError> {
        match req.operation {
            Operation::Read => self.read(&req.path).await,
            Operation::Write => self.write(&req.path, req.data.as_ref()).await,
            Operation::Delete => self.delete(&req.path).await,
            Operation::List => self.list(&req.path).await,
            // Leases over passthrough data carry no external state.
            Operation::Revoke | Operation::Renew | Operation::Rollback => Ok(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use coffer_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::barrier::Barrier;

    async fn make_backend() -> PassthroughBackend {
        let physical = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(physical as Arc<dyn StorageBackend>));
        let master = Barrier::generate_key();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();
        PassthroughBackend::new(Arc::new(BarrierView::new(barrier, "logical/kv/")))
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let backend = make_backend().await;

        let write = Request::new(Operation::Write, "foo")
            .with_data(serde_json::json!({"password": "hunter2"}));
        backend.handle_request(&write).await.unwrap();

        let read = Request::new(Operation::Read, "foo");
        let resp = backend.handle_request(&read).await.unwrap().unwrap();
        assert_eq!(resp.data.unwrap()["password"], "hunter2");
    }

    #[tokio::test]
    async fn read_wraps_value_in_secret() {
        let backend = make_backend().await;
        let write =
            Request::new(Operation::Write, "foo").with_data(serde_json::json!({"v": 1}));
        backend.handle_request(&write).await.unwrap();

        let resp = backend
            .handle_request(&Request::new(Operation::Read, "foo"))
            .await
            .unwrap()
            .unwrap();
        let secret = resp.secret.unwrap();
        assert_eq!(secret.lease_duration, Duration::zero());
    }

    #[tokio::test]
    async fn lease_field_sets_requested_duration() {
        let backend = make_backend().await;
        let write = Request::new(Operation::Write, "foo")
            .with_data(serde_json::json!({"v": 1, "lease": 120}));
        backend.handle_request(&write).await.unwrap();

        let resp = backend
            .handle_request(&Request::new(Operation::Read, "foo"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            resp.secret.unwrap().lease_duration,
            Duration::seconds(120)
        );
    }

    #[tokio::test]
    async fn read_missing_is_invalid_request() {
        let backend = make_backend().await;
        let err = backend
            .handle_request(&Request::new(Operation::Read, "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn write_without_data_rejected() {
        let backend = make_backend().await;
        let err = backend
            .handle_request(&Request::new(Operation::Write, "foo"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn delete_then_read_fails() {
        let backend = make_backend().await;
        let write =
            Request::new(Operation::Write, "foo").with_data(serde_json::json!({"v": 1}));
        backend.handle_request(&write).await.unwrap();
        backend
            .handle_request(&Request::new(Operation::Delete, "foo"))
            .await
            .unwrap();

        let err = backend
            .handle_request(&Request::new(Operation::Read, "foo"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn list_returns_keys() {
        let backend = make_backend().await;
        for key in ["a", "b", "nested/c"] {
            let write =
                Request::new(Operation::Write, key).with_data(serde_json::json!({"v": 1}));
            backend.handle_request(&write).await.unwrap();
        }

        let resp = backend
            .handle_request(&Request::new(Operation::List, ""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            resp.data.unwrap()["keys"],
            serde_json::json!(["a", "b", "nested/c"])
        );
    }

    #[tokio::test]
    async fn revoke_hook_is_a_noop() {
        let backend = make_backend().await;
        let resp = backend
            .handle_request(&Request::new(Operation::Revoke, "foo"))
            .await
            .unwrap();
        assert!(resp.is_none());
    }
}
