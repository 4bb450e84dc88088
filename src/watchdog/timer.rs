//! Periodic reconnect watchdog.
//!
//! The timer does not own reconnect logic; each tick only checks whether
//! consuming is enabled and the connection is down, and hands the actual
//! work to [`Manager::update`]. Ticks on a stopped timer are no-ops so a
//! straggling tick during shutdown cannot resurrect the connection.

use crate::manager::Manager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default period between watchdog checks.
pub const DEFAULT_RECURRENCE: Duration = Duration::from_secs(60);

pub struct ReconnectTimer {
    manager: Arc<Manager>,
    running: Arc<AtomicBool>,
    period_tx: watch::Sender<Duration>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectTimer {
    pub fn new(manager: Arc<Manager>, period: Duration) -> Self {
        let (period_tx, _) = watch::channel(period);
        Self {
            manager,
            running: Arc::new(AtomicBool::new(false)),
            period_tx,
            task: Mutex::new(None),
        }
    }

    pub fn recurrence_period(&self) -> Duration {
        *self.period_tx.borrow()
    }

    /// Changes the period; a sleeping timer loop picks the new value up
    /// immediately instead of finishing the old interval first.
    /// `send_replace` stores the value even while no loop is subscribed, so
    /// a change made before `start` (or between stop and restart) sticks.
    pub fn set_recurrence_period(&self, period: Duration) {
        self.period_tx.send_replace(period);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the periodic loop. Starting an already-running timer is a
    /// no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(period = ?self.recurrence_period(), "starting reconnect watchdog");

        let manager = Arc::clone(&self.manager);
        let running = Arc::clone(&self.running);
        let mut period_rx = self.period_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let period = *period_rx.borrow();
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        tick_once(&manager, &running).await;
                    }
                    changed = period_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        debug!(period = ?*period_rx.borrow(), "watchdog period updated");
                    }
                }
            }
        });

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping reconnect watchdog");
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    /// Runs one watchdog check immediately.
    pub async fn tick(&self) {
        tick_once(&self.manager, &self.running).await;
    }
}

async fn tick_once(manager: &Arc<Manager>, running: &AtomicBool) {
    if !running.load(Ordering::SeqCst) {
        return;
    }

    let snapshot = manager.config().snapshot();
    if !snapshot.enabled {
        return;
    }

    if manager.is_open() {
        manager.monitor().mark_healthy();
        return;
    }

    warn!("broker connection is down, triggering reconnect");
    manager.monitor().set_alert();
    manager.update().await;
}
