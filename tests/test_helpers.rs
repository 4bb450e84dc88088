//! Test helpers and utilities for integration tests

use rmq_consumer::broker::Dialer;
use rmq_consumer::config::{ConfigStore, ConsumeItem, ConsumerConfig};
use rmq_consumer::manager::Manager;
use rmq_consumer::testing::mocks::{MockChannel, MockConnection, MockDialer};
use std::sync::Arc;
use std::time::Duration;

#[allow(dead_code)]
pub const TEST_URI: &str = "amqp://rabbit.test:5672";

/// Create a test configuration with the given queues and allow-lists
#[allow(dead_code)]
pub fn test_config(queues: &[(&str, &[&str])]) -> ConsumerConfig {
    ConsumerConfig {
        enabled: true,
        service_uri: Some(TEST_URI.to_string()),
        user_name: Some("consumer".to_string()),
        password: None,
        watchdog_period: Duration::from_secs(60),
        consume: queues
            .iter()
            .map(|(name, ids)| ConsumeItem {
                queue_name: name.to_string(),
                app_ids: ids.iter().map(|s| s.to_string()).collect(),
            })
            .collect(),
        debug: false,
    }
}

pub struct Harness {
    pub manager: Arc<Manager>,
    pub dialer: Arc<MockDialer>,
    pub store: ConfigStore,
}

/// Build a manager wired to a mock dialer
#[allow(dead_code)]
pub fn harness(config: ConsumerConfig) -> Harness {
    let store = ConfigStore::new(config);
    let dialer = Arc::new(MockDialer::new());
    let manager = Manager::new(Arc::clone(&dialer) as Arc<dyn Dialer>, store.clone());
    Harness {
        manager,
        dialer,
        store,
    }
}

/// Poll `condition` until it holds or the timeout elapses
#[allow(dead_code)]
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Find the mock channel consuming `queue`, waiting for the consumer to
/// come up if needed
#[allow(dead_code)]
pub async fn consume_channel(connection: &Arc<MockConnection>, queue: &str) -> Arc<MockChannel> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(channel) = connection
            .channels()
            .into_iter()
            .find(|c| c.consumed_queue().as_deref() == Some(queue))
        {
            return channel;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no consumer started for queue {queue}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
