//! Periodic rollback sweeps.
//!
//! Backends can leave partial state behind (a write that half-completed
//! before a crash, an orphaned WAL entry). The rollback manager walks every
//! logical mount on a fixed period and issues [`Operation::Rollback`] so
//! backends get a chance to clean up. Backends with nothing to do return an
//! empty response.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::logical::{Operation, Request};
use crate::mount::MountTable;
use crate::router::Router;

/// How often each mount is swept.
const ROLLBACK_PERIOD: Duration = Duration::from_secs(60);

/// Runs the periodic rollback sweep over logical mounts.
pub struct RollbackManager {
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RollbackManager {
    /// Start the sweep over the mounts in `table`.
    #[must_use]
    pub fn start(router: Arc<Router>, table: Arc<Mutex<MountTable>>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(router, table, stop_rx));
        Self {
            stop_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop the sweep and wait for the task to finish.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "rollback task join failed");
            }
        }
    }
}

async fn run(router: Arc<Router>, table: Arc<Mutex<MountTable>>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
            () = tokio::time::sleep(ROLLBACK_PERIOD) => {
                let prefixes: Vec<String> = {
                    let table = table.lock().await;
                    table.entries.iter().map(|e| e.path.clone()).collect()
                };

                for prefix in prefixes {
                    let req = Request::new(Operation::Rollback, prefix.clone());
                    if let Err(e) = router.route(&req).await {
                        debug!(mount = %prefix, error = %e, "rollback sweep failed");
                    }
                }
            }
        }
    }
}

impl fmt::Debug for RollbackManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackManager").finish_non_exhaustive()
    }
}
