//! Outbound publish channel.

use crate::broker::BrokerChannel;
use crate::error::BrokerError;
use std::sync::Arc;

/// A dedicated channel for publishing, separate from any consume channel so
/// outbound traffic never competes with delivery dispatch.
#[derive(Clone)]
pub struct PublishChannel {
    channel: Arc<dyn BrokerChannel>,
}

impl PublishChannel {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self { channel }
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        if !self.channel.is_open() {
            return Err(BrokerError::ChannelUnavailable(
                "publish channel is closed".to_string(),
            ));
        }
        self.channel.publish(exchange, routing_key, payload).await
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.channel.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockChannel;

    #[tokio::test]
    async fn test_publish_records_payload() {
        let mock = Arc::new(MockChannel::new());
        let publish = PublishChannel::new(Arc::clone(&mock) as Arc<dyn BrokerChannel>);

        publish
            .publish("events", "orders.created", b"{\"id\":1}")
            .await
            .unwrap();

        let published = mock.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "events");
        assert_eq!(published[0].routing_key, "orders.created");
    }

    #[tokio::test]
    async fn test_publish_on_closed_channel_fails() {
        let mock = Arc::new(MockChannel::new());
        let publish = PublishChannel::new(Arc::clone(&mock) as Arc<dyn BrokerChannel>);

        mock.force_close();
        let result = publish.publish("events", "k", b"x").await;
        assert!(matches!(result, Err(BrokerError::ChannelUnavailable(_))));
        assert!(mock.published().is_empty());
    }
}
