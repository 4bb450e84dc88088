//! Broker transport seam.
//!
//! This module provides the abstraction over the AMQP client
//! ([`Dialer`] / [`BrokerConnection`] / [`BrokerChannel`]) to enable
//! dependency injection and testing; the production binding over `lapin`
//! lives in [`amqp`].

use crate::config::ConnectionConfig;
use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod amqp;

pub use amqp::{probe, AmqpDialer};

/// Reserved application id carried by diagnostic messages. Deliveries tagged
/// with it bypass the ordinary allow-list whenever debug mode is enabled.
pub const DEBUG_APP_ID: &str = "rmq.debug";

/// A message as handed to observers after the delivery filter.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredMessage {
    pub app_id: String,
    pub queue_name: String,
    pub content_type: Option<String>,
    pub headers: HashMap<String, serde_json::Value>,
    pub body: Vec<u8>,
}

/// Acknowledgement handle for a single delivery.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
}

/// A raw delivery pulled off a consumer, before filtering.
pub struct InboundDelivery {
    pub app_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: HashMap<String, serde_json::Value>,
    pub body: Vec<u8>,
    pub acker: Box<dyn DeliveryAcker>,
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("app_id", &self.app_id)
            .field("content_type", &self.content_type)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// A lightweight sub-connection used either to consume from one queue or to
/// publish.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Begin consuming from `queue`. Deliveries arrive on the returned
    /// receiver in broker delivery order; the stream ends when the channel
    /// closes, whether locally or by the broker.
    async fn start_consumer(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<InboundDelivery>, BrokerError>;

    /// Publish a payload to `exchange`/`routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError>;

    /// Close the channel. Terminates any consumer stream started on it.
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// The physical connection, multiplexed into channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Request shutdown. Implementations must resolve [`Self::wait_closed`]
    /// once the connection is actually down, for both local and
    /// broker-initiated closes.
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    /// Resolves with a human-readable reason once the connection has shut
    /// down.
    async fn wait_closed(&self) -> String;
}

/// Dials new broker connections from a config snapshot.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, config: &ConnectionConfig)
        -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}
