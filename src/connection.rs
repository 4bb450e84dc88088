//! A single managed broker connection and its channels.
//!
//! [`Connection`] wraps one dialed broker connection together with the
//! consume channels reconciled from configuration and the shared publish
//! channel. State moves forward only; a closed connection is never reopened,
//! the manager builds a fresh one instead.

use crate::broker::{BrokerChannel, BrokerConnection, Dialer};
use crate::channels::{ConsumeChannel, PublishChannel};
use crate::config::{ConnectionConfig, ConsumeItem};
use crate::error::{redact_uri, BrokerError};
use crate::listeners::ListenerRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Lifecycle of a managed connection. Transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Closing => 3,
            ConnectionState::Closed => 4,
        }
    }
}

struct Inner {
    handle: Option<Arc<dyn BrokerConnection>>,
    consumers: HashMap<String, Arc<ConsumeChannel>>,
    publish: Option<PublishChannel>,
}

pub struct Connection {
    config: ConnectionConfig,
    dialer: Arc<dyn Dialer>,
    listeners: Arc<ListenerRegistry>,
    debug: bool,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

impl Connection {
    pub fn new(
        config: ConnectionConfig,
        dialer: Arc<dyn Dialer>,
        listeners: Arc<ListenerRegistry>,
        debug: bool,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            dialer,
            listeners,
            debug,
            state_tx,
            inner: Mutex::new(Inner {
                handle: None,
                consumers: HashMap::new(),
                publish: None,
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn service_uri(&self) -> &str {
        &self.config.service_uri
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Advances the state machine. Backward transitions are dropped, so a
    /// late `Connected` can never resurrect a connection already `Closing`.
    fn advance(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if next.rank() > current.rank() {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    /// Dials the broker and opens the publish channel. On failure the
    /// connection goes straight to `Closed` and must be discarded.
    pub async fn open(&self) -> Result<(), BrokerError> {
        self.advance(ConnectionState::Connecting);
        info!(uri = %redact_uri(self.service_uri()), "connecting to broker");

        let handle = match self.dialer.dial(&self.config).await {
            Ok(handle) => handle,
            Err(err) => {
                self.advance(ConnectionState::Closed);
                return Err(err);
            }
        };

        let publish = match handle.create_channel().await {
            Ok(channel) => PublishChannel::new(channel),
            Err(err) => {
                let _ = handle.close().await;
                self.advance(ConnectionState::Closed);
                return Err(err);
            }
        };

        {
            let mut inner = self.inner.lock().await;
            inner.handle = Some(handle);
            inner.publish = Some(publish);
        }
        self.advance(ConnectionState::Connected);
        info!(uri = %redact_uri(self.service_uri()), "connected to broker");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub async fn broker_handle(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.inner.lock().await.handle.clone()
    }

    pub async fn publish_channel(&self) -> Option<PublishChannel> {
        self.inner.lock().await.publish.clone()
    }

    /// Opens a fresh standalone channel on this connection. The caller owns
    /// its lifetime.
    pub async fn create_pure_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let handle = self
            .broker_handle()
            .await
            .ok_or_else(|| BrokerError::ChannelUnavailable("connection not open".to_string()))?;
        handle.create_channel().await
    }

    /// Reconciles consume channels against the desired queue set. Repeated
    /// calls with the same input are no-ops: channels that already exist
    /// with matching allow-lists keep running untouched. Channels whose
    /// queue vanished from the set are stopped, new queues get fresh
    /// channels, and a channel whose earlier consume attempt failed is
    /// retried.
    pub async fn update_channels(&self, items: &[ConsumeItem]) {
        if self.state() != ConnectionState::Connected {
            debug!("skipping channel reconciliation, connection not open");
            return;
        }

        let handle = match self.broker_handle().await {
            Some(handle) => handle,
            None => return,
        };

        let mut inner = self.inner.lock().await;

        let desired: HashMap<&str, &ConsumeItem> =
            items.iter().map(|item| (item.queue_name.as_str(), item)).collect();

        // Stop channels for queues no longer configured, and channels whose
        // allow-list changed.
        let mut removed = Vec::new();
        for (queue, consumer) in &inner.consumers {
            match desired.get(queue.as_str()) {
                Some(item) if item.app_ids == *consumer.app_ids() => {}
                _ => removed.push(queue.clone()),
            }
        }
        for queue in removed {
            if let Some(consumer) = inner.consumers.remove(&queue) {
                info!(queue = %queue, "stopping consume channel");
                consumer.stop().await;
            }
        }

        for item in items {
            match inner.consumers.get(&item.queue_name) {
                Some(existing) if existing.is_started() => continue,
                Some(existing) => {
                    // Earlier consume attempt failed; retry on the same
                    // channel object.
                    let existing = Arc::clone(existing);
                    existing.consume().await;
                    continue;
                }
                None => {}
            }

            let channel = match handle.create_channel().await {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(queue = %item.queue_name, error = %err, "failed to open consume channel");
                    continue;
                }
            };

            let consumer = Arc::new(ConsumeChannel::new(
                item.queue_name.clone(),
                item.app_ids.clone(),
                channel,
                Arc::clone(&self.listeners),
                self.debug,
            ));
            consumer.consume().await;
            inner.consumers.insert(item.queue_name.clone(), consumer);
        }
    }

    /// Started/stopped status per configured queue.
    pub async fn consume_channel_status(&self) -> HashMap<String, bool> {
        let inner = self.inner.lock().await;
        inner
            .consumers
            .iter()
            .map(|(queue, consumer)| (queue.clone(), consumer.is_started()))
            .collect()
    }

    /// Stops all channels and asks the broker to close the connection. The
    /// connection reaches `Closed` only once the close completes, via
    /// [`Connection::finalize_closed`].
    pub async fn close(&self) {
        self.advance(ConnectionState::Closing);

        let (consumers, publish) = {
            let mut inner = self.inner.lock().await;
            (
                std::mem::take(&mut inner.consumers),
                inner.publish.take(),
            )
        };

        for (queue, consumer) in consumers {
            debug!(queue = %queue, "stopping consume channel for close");
            consumer.stop().await;
        }
        if let Some(publish) = publish {
            if let Err(err) = publish.close().await {
                debug!(error = %err, "publish channel close failed");
            }
        }

        if let Some(handle) = self.broker_handle().await {
            if let Err(err) = handle.close().await {
                warn!(error = %err, "broker connection close failed");
            }
        }
    }

    /// Resolves once the underlying connection has closed, returning the
    /// close reason. Used by the manager's close watcher.
    pub async fn wait_closed(&self) -> String {
        match self.broker_handle().await {
            Some(handle) => handle.wait_closed().await,
            None => "connection was never opened".to_string(),
        }
    }

    /// Final cleanup after the close completed. Stops any consumers still
    /// tracked (the unsolicited-close path skips [`Connection::close`]) and
    /// releases the broker handle.
    pub async fn finalize_closed(&self) {
        let (consumers, publish, handle) = {
            let mut inner = self.inner.lock().await;
            (
                std::mem::take(&mut inner.consumers),
                inner.publish.take(),
                inner.handle.take(),
            )
        };

        for consumer in consumers.into_values() {
            consumer.stop().await;
        }
        drop(publish);
        drop(handle);
        self.advance(ConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_forward_only() {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        let connection = Connection {
            config: ConnectionConfig {
                service_uri: "amqp://localhost".to_string(),
                user_name: None,
                password: None,
                watchdog_period: std::time::Duration::from_secs(60),
            },
            dialer: Arc::new(crate::testing::mocks::MockDialer::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            debug: false,
            state_tx: tx,
            inner: Mutex::new(Inner {
                handle: None,
                consumers: HashMap::new(),
                publish: None,
            }),
        };

        connection.advance(ConnectionState::Connected);
        assert_eq!(connection.state(), ConnectionState::Connected);

        connection.advance(ConnectionState::Connecting);
        assert_eq!(connection.state(), ConnectionState::Connected);

        connection.advance(ConnectionState::Closed);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
