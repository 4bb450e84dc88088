//! Connection health bookkeeping shared between the manager, the reconnect
//! timer, and the health endpoint.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Records when the connection was last seen healthy and whether the
/// watchdog currently considers it down.
#[derive(Debug, Default)]
pub struct ConnectionMonitor {
    last_healthy: Mutex<Option<DateTime<Utc>>>,
    alert: AtomicBool,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_healthy(&self) {
        if let Ok(mut last) = self.last_healthy.lock() {
            *last = Some(Utc::now());
        }
    }

    pub fn last_healthy(&self) -> Option<DateTime<Utc>> {
        self.last_healthy.lock().ok().and_then(|last| *last)
    }

    /// Raised by the watchdog when it finds the connection down; cleared
    /// once a connection opens again.
    pub fn set_alert(&self) {
        self.alert.store(true, Ordering::SeqCst);
    }

    pub fn clear_alert(&self) {
        self.alert.store(false, Ordering::SeqCst);
    }

    pub fn is_alerted(&self) -> bool {
        self.alert.load(Ordering::SeqCst)
    }
}
