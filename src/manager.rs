//! Connection supervisor.
//!
//! The [`Manager`] owns at most one [`Connection`] at a time and is the only
//! component that opens or closes connections. `update` converges the live
//! connection toward the current configuration; the watchdog calls it
//! whenever the connection is found down, and config reloads call it after
//! swapping the store.
//!
//! Locking: `update_lock` serializes the entry points (`update`, `shutdown`,
//! `shutdown_with_wait`). The connection slot uses a plain mutex held only
//! for pointer swaps, never across an await. Close watchers report back
//! through [`Manager::on_close_completed`], which takes neither lock, so a
//! shutdown waiting on close completion cannot deadlock against it.

use crate::broker::{BrokerChannel, Dialer};
use crate::channels::PublishChannel;
use crate::config::{ConfigStore, ConnectionConfig};
use crate::connection::{Connection, ConnectionState};
use crate::error::{redact_uri, BrokerError, ManagerError};
use crate::listeners::ListenerRegistry;
use crate::watchdog::ConnectionMonitor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

/// Upper bound on waiting for a close to complete before giving up.
pub const CLOSE_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct Manager {
    dialer: Arc<dyn Dialer>,
    config: ConfigStore,
    listeners: Arc<ListenerRegistry>,
    monitor: Arc<ConnectionMonitor>,
    update_lock: AsyncMutex<()>,
    connection: std::sync::Mutex<Option<Arc<Connection>>>,
    status_open: AtomicBool,
    close_notify: Notify,
}

impl Manager {
    pub fn new(dialer: Arc<dyn Dialer>, config: ConfigStore) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            config,
            listeners: Arc::new(ListenerRegistry::new()),
            monitor: Arc::new(ConnectionMonitor::new()),
            update_lock: AsyncMutex::new(()),
            connection: std::sync::Mutex::new(None),
            status_open: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// True once a connection has opened and its open handling finished, and
    /// false again as soon as a close completes.
    pub fn is_open(&self) -> bool {
        self.status_open.load(Ordering::SeqCst)
    }

    fn current_connection(&self) -> Option<Arc<Connection>> {
        self.connection
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
    }

    fn store_connection(&self, connection: Option<Arc<Connection>>) {
        if let Ok(mut slot) = self.connection.lock() {
            *slot = connection;
        }
    }

    /// Converges the live connection toward the current configuration:
    /// closes it when consuming is disabled or connection parameters
    /// changed, reconciles channels when it is healthy, and opens a new one
    /// when there is none.
    pub async fn update(self: &Arc<Self>) {
        let _guard = self.update_lock.lock().await;
        self.update_locked().await;
    }

    async fn update_locked(self: &Arc<Self>) {
        let snapshot = self.config.snapshot();

        if let Some(connection) = self.current_connection() {
            if !snapshot.enabled {
                info!("consuming disabled, closing connection");
                self.close_and_wait(&connection, CLOSE_WAIT_TIMEOUT).await;
                return;
            }

            let desired = snapshot
                .service_uri
                .clone()
                .map(|uri| ConnectionConfig::from_consumer(&snapshot, uri));
            match desired {
                Some(desired) if desired.matches(connection.config()) => {
                    if connection.is_open() {
                        connection.update_channels(&snapshot.consume).await;
                    } else {
                        debug!("connection in transition, leaving it alone");
                    }
                    return;
                }
                _ => {
                    info!("connection parameters changed, recreating connection");
                    self.close_and_wait(&connection, CLOSE_WAIT_TIMEOUT).await;
                    // Fall through to open against the new parameters.
                }
            }
        }

        if !snapshot.enabled {
            return;
        }
        let Some(uri) = snapshot.service_uri.clone() else {
            debug!("no service URI configured, not connecting");
            return;
        };
        let desired = ConnectionConfig::from_consumer(&snapshot, uri);

        let connection = Arc::new(Connection::new(
            desired,
            Arc::clone(&self.dialer),
            Arc::clone(&self.listeners),
            snapshot.debug,
        ));

        if let Err(err) = connection.open().await {
            warn!(
                uri = %redact_uri(connection.service_uri()),
                error = %err,
                "failed to open connection"
            );
            return;
        }

        self.store_connection(Some(Arc::clone(&connection)));
        self.handle_opened(&connection).await;
    }

    async fn handle_opened(self: &Arc<Self>, connection: &Arc<Connection>) {
        self.monitor.mark_healthy();
        self.monitor.clear_alert();

        // Report open before the close watcher exists. Open handling awaits
        // observer callbacks below, and a close completing during that window
        // must find the flag already set so it leaves it false, not the other
        // way around.
        self.status_open.store(true, Ordering::SeqCst);
        self.spawn_close_watcher(Arc::clone(connection));

        if let Some(handle) = connection.broker_handle().await {
            self.listeners
                .fire_on_open(&handle, connection.service_uri())
                .await;
        }

        let snapshot = self.config.snapshot();
        connection.update_channels(&snapshot.consume).await;
    }

    /// Watches one connection for close completion. Holds only a weak
    /// manager reference so a dropped manager does not keep watcher tasks
    /// alive.
    fn spawn_close_watcher(self: &Arc<Self>, connection: Arc<Connection>) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = connection.wait_closed().await;
            if let Some(manager) = manager.upgrade() {
                manager.on_close_completed(&connection, &reason).await;
            }
        });
    }

    /// Single completion path for solicited and unsolicited closes. Clears
    /// the slot when the closed connection is still the current one,
    /// finalizes teardown, and notifies observers and shutdown waiters.
    async fn on_close_completed(&self, connection: &Arc<Connection>, reason: &str) {
        if connection.state() == ConnectionState::Closed {
            return;
        }

        info!(
            uri = %redact_uri(connection.service_uri()),
            reason = %reason,
            "connection close completed"
        );

        let was_current = {
            match self.connection.lock() {
                Ok(mut slot) => match slot.as_ref() {
                    Some(current) if Arc::ptr_eq(current, connection) => {
                        *slot = None;
                        true
                    }
                    _ => false,
                },
                Err(_) => false,
            }
        };
        if was_current {
            self.status_open.store(false, Ordering::SeqCst);
        }

        connection.finalize_closed().await;
        self.listeners
            .fire_on_close_completed(connection.service_uri())
            .await;
        self.close_notify.notify_waiters();
    }

    /// Closes `connection` and waits for its completion path to run, bounded
    /// by `timeout`. On timeout the completion path is forced so the slot
    /// does not stay occupied by a dead connection. Callers hold
    /// `update_lock`.
    async fn close_and_wait(&self, connection: &Arc<Connection>, timeout: Duration) -> bool {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        connection.close().await;

        if tokio::time::timeout(timeout, notified).await.is_ok() {
            true
        } else {
            warn!(timeout = ?timeout, "close did not complete in time, forcing teardown");
            self.on_close_completed(connection, "close timed out").await;
            false
        }
    }

    /// Asks the current connection to close without waiting for completion.
    pub async fn shutdown(self: &Arc<Self>) {
        let _guard = self.update_lock.lock().await;
        if let Some(connection) = self.current_connection() {
            connection.close().await;
        }
    }

    /// Closes the current connection and blocks until the close has fully
    /// completed, including observer notification. Returns an error if
    /// completion does not happen within [`CLOSE_WAIT_TIMEOUT`].
    pub async fn shutdown_with_wait(self: &Arc<Self>) -> Result<(), ManagerError> {
        self.shutdown_with_wait_for(CLOSE_WAIT_TIMEOUT).await
    }

    pub async fn shutdown_with_wait_for(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<(), ManagerError> {
        let _guard = self.update_lock.lock().await;
        let Some(connection) = self.current_connection() else {
            return Ok(());
        };

        if self.close_and_wait(&connection, timeout).await {
            Ok(())
        } else {
            Err(ManagerError::CloseTimeout(timeout))
        }
    }

    /// Started/stopped status of each consume channel on the current
    /// connection. Empty when there is no connection.
    pub async fn channel_status(&self) -> HashMap<String, bool> {
        match self.current_connection() {
            Some(connection) => connection.consume_channel_status().await,
            None => HashMap::new(),
        }
    }

    pub async fn publish_channel(&self) -> Option<PublishChannel> {
        match self.current_connection() {
            Some(connection) => connection.publish_channel().await,
            None => None,
        }
    }

    /// Opens a standalone channel on the current connection for callers that
    /// manage their own channel lifetime.
    pub async fn create_pure_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        match self.current_connection() {
            Some(connection) => connection.create_pure_channel().await,
            None => Err(BrokerError::ChannelUnavailable(
                "no connection available".to_string(),
            )),
        }
    }

    pub fn service_uri(&self) -> Option<String> {
        self.current_connection()
            .map(|connection| connection.service_uri().to_string())
    }
}
