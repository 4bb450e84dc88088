//! Mock broker and observer implementations.
//!
//! [`MockDialer`] hands out [`MockConnection`]s whose channels record every
//! publish and ack, and whose deliveries are injected by tests. Remote
//! closes are simulated with [`MockConnection::trigger_remote_close`], which
//! resolves `wait_closed` exactly like a broker-initiated close does.

use crate::broker::{
    BrokerChannel, BrokerConnection, Dialer, DeliveryAcker, InboundDelivery,
};
use crate::config::ConnectionConfig;
use crate::error::BrokerError;
use crate::listeners::{ConnectionObserver, MessageObserver, ObserverError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// Scripted dialer. By default every dial succeeds with a fresh
/// [`MockConnection`]; failures can be queued with [`MockDialer::fail_next`].
#[derive(Default)]
pub struct MockDialer {
    dial_count: AtomicUsize,
    failures: Mutex<Vec<BrokerError>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error returned by the next dial attempt. Multiple queued
    /// errors are consumed in order.
    pub fn fail_next(&self, error: BrokerError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(error);
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dial_count.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections().last().cloned()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.dial_count.fetch_add(1, Ordering::SeqCst);

        let scripted = self
            .failures
            .lock()
            .ok()
            .and_then(|mut failures| if failures.is_empty() { None } else { Some(failures.remove(0)) });
        if let Some(error) = scripted {
            return Err(error);
        }

        let connection = Arc::new(MockConnection::new(config.service_uri.clone()));
        if let Ok(mut connections) = self.connections.lock() {
            connections.push(Arc::clone(&connection));
        }
        Ok(connection)
    }
}

pub struct MockConnection {
    service_uri: String,
    open: AtomicBool,
    fail_channel_create: AtomicBool,
    hang_on_close: AtomicBool,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    closed_tx: watch::Sender<Option<String>>,
    closed_rx: watch::Receiver<Option<String>>,
}

impl MockConnection {
    pub fn new(service_uri: String) -> Self {
        let (closed_tx, closed_rx) = watch::channel(None);
        Self {
            service_uri,
            open: AtomicBool::new(true),
            fail_channel_create: AtomicBool::new(false),
            hang_on_close: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
            closed_tx,
            closed_rx,
        }
    }

    pub fn service_uri(&self) -> &str {
        &self.service_uri
    }

    /// Makes subsequent `create_channel` calls fail.
    pub fn fail_channel_creation(&self) {
        self.fail_channel_create.store(true, Ordering::SeqCst);
    }

    pub fn allow_channel_creation(&self) {
        self.fail_channel_create.store(false, Ordering::SeqCst);
    }

    /// Makes `close` never report completion, simulating a broker that stops
    /// responding mid-close.
    pub fn hang_on_close(&self) {
        self.hang_on_close.store(true, Ordering::SeqCst);
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Simulates the broker dropping the connection: all channels close and
    /// `wait_closed` resolves with `reason`.
    pub fn trigger_remote_close(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels() {
            channel.force_close();
        }
        let _ = self.closed_tx.send(Some(reason.to_string()));
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if self.fail_channel_create.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelUnavailable(
                "channel creation disabled".to_string(),
            ));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelUnavailable(
                "connection closed".to_string(),
            ));
        }

        let channel = Arc::new(MockChannel::new());
        if let Ok(mut channels) = self.channels.lock() {
            channels.push(Arc::clone(&channel));
        }
        Ok(channel)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels() {
            channel.force_close();
        }
        if !self.hang_on_close.load(Ordering::SeqCst) {
            let _ = self.closed_tx.send(Some("closed locally".to_string()));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn wait_closed(&self) -> String {
        let mut rx = self.closed_rx.clone();
        loop {
            if let Some(reason) = rx.borrow().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "close notifier dropped".to_string();
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct MockChannel {
    closed: AtomicBool,
    consumed_queue: Mutex<Option<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    delivery_tx: Mutex<Option<mpsc::Sender<InboundDelivery>>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumed_queue(&self) -> Option<String> {
        self.consumed_queue.lock().ok().and_then(|q| q.clone())
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Closes the channel without going through the trait, ending any
    /// consumer stream started on it.
    pub fn force_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut tx) = self.delivery_tx.lock() {
            tx.take();
        }
    }

    /// Injects a delivery as if the broker pushed it, returning the acker so
    /// the test can assert on acknowledgement. Panics if no consumer was
    /// started.
    pub async fn deliver(
        &self,
        app_id: Option<&str>,
        body: &[u8],
    ) -> Arc<MockAcker> {
        self.deliver_full(app_id, None, HashMap::new(), body).await
    }

    pub async fn deliver_full(
        &self,
        app_id: Option<&str>,
        content_type: Option<&str>,
        headers: HashMap<String, serde_json::Value>,
        body: &[u8],
    ) -> Arc<MockAcker> {
        let tx = self
            .delivery_tx
            .lock()
            .ok()
            .and_then(|tx| tx.clone())
            .expect("no consumer started on mock channel");

        let acker = Arc::new(MockAcker::default());
        let delivery = InboundDelivery {
            app_id: app_id.map(str::to_string),
            content_type: content_type.map(str::to_string),
            headers,
            body: body.to_vec(),
            acker: Box::new(SharedAcker(Arc::clone(&acker))),
        };
        tx.send(delivery).await.expect("consumer receiver dropped");
        acker
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn start_consumer(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<mpsc::Receiver<InboundDelivery>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelUnavailable(
                "channel closed".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(16);
        if let Ok(mut queue_slot) = self.consumed_queue.lock() {
            *queue_slot = Some(queue.to_string());
        }
        if let Ok(mut tx_slot) = self.delivery_tx.lock() {
            *tx_slot = Some(tx);
        }
        Ok(rx)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelUnavailable(
                "channel closed".to_string(),
            ));
        }
        if let Ok(mut published) = self.published.lock() {
            published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.force_close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Counts acknowledgements so tests can assert exactly-once acking.
#[derive(Default)]
pub struct MockAcker {
    acks: AtomicUsize,
}

impl MockAcker {
    pub fn ack_count(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }
}

struct SharedAcker(Arc<MockAcker>);

#[async_trait]
impl DeliveryAcker for SharedAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records connection lifecycle callbacks.
#[derive(Default)]
pub struct RecordingConnectionObserver {
    opened: Mutex<Vec<String>>,
    closed: Mutex<Vec<String>>,
}

impl RecordingConnectionObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ConnectionObserver for RecordingConnectionObserver {
    async fn on_open(
        &self,
        _control: Arc<dyn BrokerChannel>,
        service_uri: &str,
    ) -> Result<(), ObserverError> {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(service_uri.to_string());
        }
        Ok(())
    }

    async fn on_close_completed(&self, service_uri: &str) -> Result<(), ObserverError> {
        if let Ok(mut closed) = self.closed.lock() {
            closed.push(service_uri.to_string());
        }
        Ok(())
    }
}

/// Records message callbacks for one app id.
pub struct RecordingMessageObserver {
    app_id: String,
    received: Mutex<Vec<crate::broker::DeliveredMessage>>,
    bound: Mutex<Vec<String>>,
    unbound: Mutex<Vec<String>>,
}

impl RecordingMessageObserver {
    pub fn new(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            received: Mutex::new(Vec::new()),
            bound: Mutex::new(Vec::new()),
            unbound: Mutex::new(Vec::new()),
        }
    }

    pub fn received(&self) -> Vec<crate::broker::DeliveredMessage> {
        self.received.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn bound_queues(&self) -> Vec<String> {
        self.bound.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn unbound_queues(&self) -> Vec<String> {
        self.unbound.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MessageObserver for RecordingMessageObserver {
    fn app_id(&self) -> &str {
        &self.app_id
    }

    async fn on_bind(&self, queue_name: &str) -> Result<(), ObserverError> {
        if let Ok(mut bound) = self.bound.lock() {
            bound.push(queue_name.to_string());
        }
        Ok(())
    }

    async fn on_unbind(&self, queue_name: &str) -> Result<(), ObserverError> {
        if let Ok(mut unbound) = self.unbound.lock() {
            unbound.push(queue_name.to_string());
        }
        Ok(())
    }

    async fn on_receive(
        &self,
        message: &crate::broker::DeliveredMessage,
    ) -> Result<(), ObserverError> {
        if let Ok(mut received) = self.received.lock() {
            received.push(message.clone());
        }
        Ok(())
    }
}

/// Fails every callback while still counting invocations, for testing
/// observer isolation.
pub struct FailingMessageObserver {
    app_id: String,
    calls: AtomicUsize,
}

impl FailingMessageObserver {
    pub fn new(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageObserver for FailingMessageObserver {
    fn app_id(&self) -> &str {
        &self.app_id
    }

    async fn on_bind(&self, _queue_name: &str) -> Result<(), ObserverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("bind rejected".into())
    }

    async fn on_unbind(&self, _queue_name: &str) -> Result<(), ObserverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("unbind rejected".into())
    }

    async fn on_receive(
        &self,
        _message: &crate::broker::DeliveredMessage,
    ) -> Result<(), ObserverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("receive rejected".into())
    }
}
