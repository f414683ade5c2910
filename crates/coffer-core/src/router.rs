//! Request routing to mounted backends.
//!
//! The router owns a longest-prefix-match table from mount prefix to
//! backend. Routing rewrites the request path to be relative to the mount,
//! so backends never see (or depend on) where they are mounted. Mount
//! prefixes must not overlap.

use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::RouteError;
use crate::logical::{pattern_match, Backend, Request, Response};
use crate::view::BarrierView;

/// A single routing entry.
struct RouteEntry {
    prefix: String,
    backend: Arc<dyn Backend>,
    /// Kept so the mount's storage namespace is discoverable from the
    /// routing table (teardown, diagnostics).
    view: Arc<BarrierView>,
    login_paths: Vec<String>,
    root_paths: Vec<String>,
}

/// Longest-prefix-match router over mounted backends.
pub struct Router {
    entries: RwLock<Vec<RouteEntry>>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Mount a backend at the given path prefix.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::MountConflict`] if the prefix overlaps an
    /// existing mount in either direction.
    pub async fn mount(
        &self,
        prefix: impl Into<String>,
        backend: Arc<dyn Backend>,
        view: Arc<BarrierView>,
    ) -> Result<(), RouteError> {
        let prefix = prefix.into();
        let mut entries = self.entries.write().await;

        for existing in entries.iter() {
            if existing.prefix.starts_with(&prefix) || prefix.starts_with(&existing.prefix) {
                return Err(RouteError::MountConflict { path: prefix });
            }
        }

        let login_paths = backend.login_paths();
        let root_paths = backend.root_paths();
        entries.push(RouteEntry {
            prefix,
            backend,
            view,
            login_paths,
            root_paths,
        });
        Ok(())
    }

    /// Unmount the backend at the given prefix.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotMounted`] if no mount has this prefix.
    pub async fn unmount(&self, prefix: &str) -> Result<(), RouteError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.prefix != prefix);
        if entries.len() == before {
            return Err(RouteError::NotMounted {
                path: prefix.to_owned(),
            });
        }
        Ok(())
    }

    /// Remove every mount. Used during pre-seal teardown.
    pub async fn unmount_all(&self) {
        self.entries.write().await.clear();
    }

    /// Route a request to the backend serving its path.
    ///
    /// # Errors
    ///
    /// - [`RouteError::NoMount`] if no mount matches the path.
    /// - [`RouteError::Backend`] if the backend fails.
    pub async fn route(&self, req: &Request) -> Result<Option<Response>, RouteError> {
        let (backend, relative) = {
            let entries = self.entries.read().await;
            let entry = longest_match(&entries, &req.path).ok_or_else(|| RouteError::NoMount {
                path: req.path.clone(),
            })?;
            let relative = req.path[entry.prefix.len()..].to_owned();
            (Arc::clone(&entry.backend), relative)
        };

        let mut routed = req.clone();
        routed.path = relative;
        let resp = backend.handle_request(&routed).await?;
        Ok(resp)
    }

    /// The mount prefix serving `path`, if any.
    pub async fn matching_mount(&self, path: &str) -> Option<String> {
        let entries = self.entries.read().await;
        longest_match(&entries, path).map(|e| e.prefix.clone())
    }

    /// The storage prefix of the mount serving `path`, if any.
    pub async fn matching_storage_prefix(&self, path: &str) -> Option<String> {
        let entries = self.entries.read().await;
        longest_match(&entries, path).map(|e| e.view.prefix().to_owned())
    }

    /// Whether `path` is served unauthenticated by its backend.
    pub async fn login_path(&self, path: &str) -> bool {
        let entries = self.entries.read().await;
        let Some(entry) = longest_match(&entries, path) else {
            return false;
        };
        let relative = &path[entry.prefix.len()..];
        entry.login_paths.iter().any(|p| pattern_match(p, relative))
    }

    /// Whether `path` is root-protected by its backend.
    pub async fn root_path(&self, path: &str) -> bool {
        let entries = self.entries.read().await;
        let Some(entry) = longest_match(&entries, path) else {
            return false;
        };
        let relative = &path[entry.prefix.len()..];
        entry.root_paths.iter().any(|p| pattern_match(p, relative))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn longest_match<'a>(entries: &'a [RouteEntry], path: &str) -> Option<&'a RouteEntry> {
    entries
        .iter()
        .filter(|e| path.starts_with(&e.prefix))
        .max_by_key(|e| e.prefix.len())
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use coffer_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::barrier::Barrier;
    use crate::error::BackendError;
    use crate::logical::Operation;

    /// Records the relative path it was invoked with.
    struct EchoBackend {
        login: Vec<String>,
        root: Vec<String>,
    }

    #[async_trait::async_trait]
    impl Backend for EchoBackend {
        async fn handle_request(&self, req: &Request) -> Result<Option<Response>, BackendError> {
            Ok(Some(Response::data(serde_json::json!({
                "relative_path": req.path,
            }))))
        }

        fn login_paths(&self) -> Vec<String> {
            self.login.clone()
        }

        fn root_paths(&self) -> Vec<String> {
            self.root.clone()
        }
    }

    async fn make_view(prefix: &str) -> Arc<BarrierView> {
        let physical = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(physical as Arc<dyn StorageBackend>));
        Arc::new(BarrierView::new(barrier, prefix))
    }

    fn echo(login: &[&str], root: &[&str]) -> Arc<dyn Backend> {
        Arc::new(EchoBackend {
            login: login.iter().map(|s| (*s).to_owned()).collect(),
            root: root.iter().map(|s| (*s).to_owned()).collect(),
        })
    }

    #[tokio::test]
    async fn route_rewrites_path_relative_to_mount() {
        let router = Router::new();
        router
            .mount("secret/", echo(&[], &[]), make_view("logical/a/").await)
            .await
            .unwrap();

        let req = Request::new(Operation::Read, "secret/foo/bar");
        let resp = router.route(&req).await.unwrap().unwrap();
        assert_eq!(
            resp.data.unwrap()["relative_path"],
            serde_json::json!("foo/bar")
        );
    }

    #[tokio::test]
    async fn route_unmounted_path_fails() {
        let router = Router::new();
        let req = Request::new(Operation::Read, "nope/foo");
        let err = router.route(&req).await.unwrap_err();
        assert!(matches!(err, RouteError::NoMount { .. }));
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let router = Router::new();
        router
            .mount("auth/", echo(&[], &[]), make_view("auth/outer/").await)
            .await
            .unwrap();
        // Nested prefixes conflict, so use sibling prefixes to check
        // longest-match ordering instead.
        router
            .mount("auth2/token/", echo(&[], &[]), make_view("auth/inner/").await)
            .await
            .unwrap();

        assert_eq!(
            router.matching_mount("auth2/token/create").await,
            Some("auth2/token/".to_owned())
        );
        assert_eq!(
            router.matching_mount("auth/userpass/login").await,
            Some("auth/".to_owned())
        );
    }

    #[tokio::test]
    async fn overlapping_mounts_conflict() {
        let router = Router::new();
        router
            .mount("secret/", echo(&[], &[]), make_view("logical/a/").await)
            .await
            .unwrap();

        let err = router
            .mount("secret/nested/", echo(&[], &[]), make_view("logical/b/").await)
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::MountConflict { .. }));

        let err = router
            .mount("sec", echo(&[], &[]), make_view("logical/c/").await)
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::MountConflict { .. }));
    }

    #[tokio::test]
    async fn unmount_removes_entry() {
        let router = Router::new();
        router
            .mount("secret/", echo(&[], &[]), make_view("logical/a/").await)
            .await
            .unwrap();
        router.unmount("secret/").await.unwrap();

        assert!(router.matching_mount("secret/foo").await.is_none());
        let err = router.unmount("secret/").await.unwrap_err();
        assert!(matches!(err, RouteError::NotMounted { .. }));
    }

    #[tokio::test]
    async fn login_path_honours_backend_patterns() {
        let router = Router::new();
        router
            .mount(
                "auth/userpass/",
                echo(&["login/*"], &[]),
                make_view("auth/up/").await,
            )
            .await
            .unwrap();

        assert!(router.login_path("auth/userpass/login/alice").await);
        assert!(!router.login_path("auth/userpass/config").await);
        assert!(!router.login_path("unmounted/login").await);
    }

    #[tokio::test]
    async fn root_path_honours_backend_patterns() {
        let router = Router::new();
        router
            .mount(
                "sys/",
                echo(&[], &["mounts/*", "policy/*"]),
                make_view("sys-view/").await,
            )
            .await
            .unwrap();

        assert!(router.root_path("sys/mounts/secret/").await);
        assert!(router.root_path("sys/policy/dev").await);
        assert!(!router.root_path("sys/mounts").await);
    }

    #[tokio::test]
    async fn unmount_all_clears_table() {
        let router = Router::new();
        router
            .mount("secret/", echo(&[], &[]), make_view("logical/a/").await)
            .await
            .unwrap();
        router
            .mount("sys/", echo(&[], &[]), make_view("sys-view/").await)
            .await
            .unwrap();

        router.unmount_all().await;
        assert!(router.matching_mount("secret/foo").await.is_none());
        assert!(router.matching_mount("sys/mounts").await.is_none());
    }
}
