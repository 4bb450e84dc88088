//! Observer registration and event fan-out.
//!
//! Two observer families exist: [`ConnectionObserver`] for connection-scope
//! events and [`MessageObserver`] for queue-scope events. Registration hands
//! back a token so callers can unregister later. Fan-out isolates observers
//! from each other: one failing observer never stops delivery to the rest.

use crate::broker::{BrokerChannel, BrokerConnection, DeliveredMessage};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Errors surfaced by observer callbacks. Observers own their failure types;
/// the registry only logs them.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Notified when the managed connection opens or finishes closing.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// Called after the connection opens. `control` is a fresh channel opened
    /// for this observer alone and closed once the callback returns; use it
    /// for setup work like declaring exchanges or bindings.
    async fn on_open(
        &self,
        control: Arc<dyn BrokerChannel>,
        service_uri: &str,
    ) -> Result<(), ObserverError>;

    /// Called once the connection has fully closed, whatever the cause.
    async fn on_close_completed(&self, service_uri: &str) -> Result<(), ObserverError>;
}

/// Consumes messages from queues whose allow-list contains this observer's
/// application id.
#[async_trait]
pub trait MessageObserver: Send + Sync {
    /// The application id this observer is interested in.
    fn app_id(&self) -> &str;

    /// A consume channel matching this observer's app id started consuming.
    async fn on_bind(&self, queue_name: &str) -> Result<(), ObserverError>;

    /// A consume channel matching this observer's app id stopped consuming.
    async fn on_unbind(&self, queue_name: &str) -> Result<(), ObserverError>;

    /// A message carrying this observer's app id arrived.
    async fn on_receive(&self, message: &DeliveredMessage) -> Result<(), ObserverError>;
}

/// Handle returned by registration; pass it back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

/// Holds registered observers and fires events at them.
///
/// Registration and removal take a write lock briefly; fan-out clones the
/// observer list out before awaiting anything, so callbacks never run under
/// the lock.
pub struct ListenerRegistry {
    next_token: AtomicU64,
    connection_observers: RwLock<Vec<(ObserverToken, Arc<dyn ConnectionObserver>)>>,
    message_observers: RwLock<Vec<(ObserverToken, Arc<dyn MessageObserver>)>>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            connection_observers: RwLock::new(Vec::new()),
            message_observers: RwLock::new(Vec::new()),
        }
    }

    pub fn register_connection_observer(
        &self,
        observer: Arc<dyn ConnectionObserver>,
    ) -> ObserverToken {
        let token = ObserverToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut observers) = self.connection_observers.write() {
            observers.push((token, observer));
        }
        token
    }

    pub fn register_message_observer(&self, observer: Arc<dyn MessageObserver>) -> ObserverToken {
        let token = ObserverToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut observers) = self.message_observers.write() {
            observers.push((token, observer));
        }
        token
    }

    /// Removes the observer registered under `token`. Unknown tokens are a
    /// no-op.
    pub fn unregister(&self, token: ObserverToken) {
        if let Ok(mut observers) = self.connection_observers.write() {
            observers.retain(|(t, _)| *t != token);
        }
        if let Ok(mut observers) = self.message_observers.write() {
            observers.retain(|(t, _)| *t != token);
        }
    }

    fn connection_observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.connection_observers
            .read()
            .map(|observers| observers.iter().map(|(_, o)| Arc::clone(o)).collect())
            .unwrap_or_default()
    }

    fn message_observers(&self) -> Vec<Arc<dyn MessageObserver>> {
        self.message_observers
            .read()
            .map(|observers| observers.iter().map(|(_, o)| Arc::clone(o)).collect())
            .unwrap_or_default()
    }

    /// Fires `on_open` at every connection observer. Each observer gets its
    /// own fresh channel, closed again once the callback returns, so a
    /// misbehaving observer cannot poison a channel anyone else relies on.
    pub async fn fire_on_open(&self, connection: &Arc<dyn BrokerConnection>, service_uri: &str) {
        for observer in self.connection_observers() {
            let control = match connection.create_channel().await {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(error = %err, "could not open control channel for observer");
                    continue;
                }
            };

            if let Err(err) = observer.on_open(Arc::clone(&control), service_uri).await {
                warn!(error = %err, "connection observer on_open failed");
            }

            if let Err(err) = control.close().await {
                debug!(error = %err, "control channel close failed");
            }
        }
    }

    pub async fn fire_on_close_completed(&self, service_uri: &str) {
        for observer in self.connection_observers() {
            if let Err(err) = observer.on_close_completed(service_uri).await {
                warn!(error = %err, "connection observer on_close_completed failed");
            }
        }
    }

    /// Fires `on_bind` at message observers whose app id is in the queue's
    /// allow-list.
    pub async fn fire_on_bind(&self, queue_name: &str, app_ids: &HashSet<String>) {
        for observer in self.message_observers() {
            if !app_ids.contains(observer.app_id()) {
                continue;
            }
            if let Err(err) = observer.on_bind(queue_name).await {
                warn!(queue = %queue_name, error = %err, "message observer on_bind failed");
            }
        }
    }

    pub async fn fire_on_unbind(&self, queue_name: &str, app_ids: &HashSet<String>) {
        for observer in self.message_observers() {
            if !app_ids.contains(observer.app_id()) {
                continue;
            }
            if let Err(err) = observer.on_unbind(queue_name).await {
                warn!(queue = %queue_name, error = %err, "message observer on_unbind failed");
            }
        }
    }

    /// Fires `on_receive` at observers whose app id matches the message's.
    pub async fn fire_on_receive(&self, message: &DeliveredMessage) {
        for observer in self.message_observers() {
            if observer.app_id() != message.app_id {
                continue;
            }
            if let Err(err) = observer.on_receive(message).await {
                warn!(
                    queue = %message.queue_name,
                    app_id = %message.app_id,
                    error = %err,
                    "message observer on_receive failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{RecordingConnectionObserver, RecordingMessageObserver};

    #[test]
    fn test_register_and_unregister() {
        let registry = ListenerRegistry::new();
        let observer = Arc::new(RecordingMessageObserver::new("app.a"));

        let token = registry.register_message_observer(observer);
        assert_eq!(registry.message_observers().len(), 1);

        registry.unregister(token);
        assert!(registry.message_observers().is_empty());
    }

    #[test]
    fn test_unregister_unknown_token_is_noop() {
        let registry = ListenerRegistry::new();
        registry.register_connection_observer(Arc::new(RecordingConnectionObserver::new()));

        registry.unregister(ObserverToken(9999));
        assert_eq!(registry.connection_observers().len(), 1);
    }

    #[test]
    fn test_tokens_are_unique_across_families() {
        let registry = ListenerRegistry::new();
        let a = registry.register_connection_observer(Arc::new(RecordingConnectionObserver::new()));
        let b = registry.register_message_observer(Arc::new(RecordingMessageObserver::new("x")));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_on_receive_filters_by_app_id() {
        let registry = ListenerRegistry::new();
        let matching = Arc::new(RecordingMessageObserver::new("app.a"));
        let other = Arc::new(RecordingMessageObserver::new("app.b"));
        registry.register_message_observer(Arc::clone(&matching) as Arc<dyn MessageObserver>);
        registry.register_message_observer(Arc::clone(&other) as Arc<dyn MessageObserver>);

        let message = DeliveredMessage {
            app_id: "app.a".to_string(),
            queue_name: "orders".to_string(),
            content_type: None,
            headers: Default::default(),
            body: b"{}".to_vec(),
        };
        registry.fire_on_receive(&message).await;

        assert_eq!(matching.received().len(), 1);
        assert!(other.received().is_empty());
    }

    #[tokio::test]
    async fn test_on_bind_filters_by_allow_list() {
        let registry = ListenerRegistry::new();
        let listed = Arc::new(RecordingMessageObserver::new("app.a"));
        let unlisted = Arc::new(RecordingMessageObserver::new("app.z"));
        registry.register_message_observer(Arc::clone(&listed) as Arc<dyn MessageObserver>);
        registry.register_message_observer(Arc::clone(&unlisted) as Arc<dyn MessageObserver>);

        let app_ids: HashSet<String> = ["app.a".to_string()].into_iter().collect();
        registry.fire_on_bind("orders", &app_ids).await;
        registry.fire_on_unbind("orders", &app_ids).await;

        assert_eq!(listed.bound_queues(), vec!["orders".to_string()]);
        assert_eq!(listed.unbound_queues(), vec!["orders".to_string()]);
        assert!(unlisted.bound_queues().is_empty());
    }
}
