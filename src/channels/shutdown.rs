//! Two-stage teardown for dispatch workers.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long to wait for a worker to drain before aborting it, and how long
/// to wait for the abort to take effect.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownPolicy {
    pub grace: Duration,
    pub force: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(10),
            force: Duration::from_secs(60),
        }
    }
}

impl ShutdownPolicy {
    /// Waits `grace` for the task to finish on its own, then aborts it and
    /// waits up to `force` for the abort to land. Never blocks beyond
    /// `grace + force`.
    pub async fn run(&self, name: &str, mut handle: JoinHandle<()>) {
        if tokio::time::timeout(self.grace, &mut handle).await.is_ok() {
            debug!(worker = %name, "worker drained within grace period");
            return;
        }

        warn!(worker = %name, grace = ?self.grace, "worker did not drain, aborting");
        handle.abort();
        if tokio::time::timeout(self.force, handle).await.is_err() {
            warn!(worker = %name, force = ?self.force, "worker still running after abort");
        }
    }
}
