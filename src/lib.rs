//! Supervised RabbitMQ consumer.
//!
//! One [`manager::Manager`] owns a single long-lived broker connection,
//! reconciles per-queue consume channels from configuration, and fans
//! deliveries out to registered observers. A watchdog timer re-dials the
//! broker whenever the connection is found down, and shutdown waits for the
//! close to fully complete before returning.
//!
//! The broker is reached through the [`broker::Dialer`] trait; production
//! uses the AMQP implementation in [`broker::amqp`], tests use the mocks in
//! [`testing::mocks`].
//!
//! ```
//! use rmq_consumer::broker::Dialer;
//! use rmq_consumer::config::{ConfigStore, ConsumerConfig};
//! use rmq_consumer::manager::Manager;
//! use rmq_consumer::testing::mocks::MockDialer;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = ConfigStore::new(ConsumerConfig {
//!     enabled: true,
//!     service_uri: Some("amqp://localhost:5672".to_string()),
//!     ..Default::default()
//! });
//! let dialer: Arc<dyn Dialer> = Arc::new(MockDialer::new());
//! let manager = Manager::new(dialer, config);
//!
//! manager.update().await;
//! assert!(manager.is_open());
//!
//! manager.shutdown_with_wait().await.unwrap();
//! assert!(!manager.is_open());
//! # });
//! ```

pub mod broker;
pub mod channels;
pub mod config;
pub mod connection;
pub mod error;
pub mod listeners;
pub mod manager;
pub mod observability;
pub mod testing;
pub mod watchdog;

pub use broker::{DeliveredMessage, DEBUG_APP_ID};
pub use config::{ConfigStore, ConsumeItem, ConsumerConfig};
pub use error::{BrokerError, ConfigError, ManagerError, ManagerResult};
pub use listeners::{ConnectionObserver, ListenerRegistry, MessageObserver, ObserverToken};
pub use manager::Manager;
pub use watchdog::{ConnectionMonitor, ReconnectTimer};
