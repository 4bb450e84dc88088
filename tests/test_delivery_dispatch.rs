//! Delivery dispatch tests: app-id filtering, acking, ordering, and
//! observer isolation, end to end through manager, channels, and mocks.

use rmq_consumer::broker::DEBUG_APP_ID;
use rmq_consumer::listeners::MessageObserver;
use rmq_consumer::testing::mocks::{FailingMessageObserver, RecordingMessageObserver};
use std::sync::Arc;
use std::time::Duration;

mod test_helpers;
use test_helpers::{consume_channel, harness, test_config, wait_until};

#[tokio::test]
async fn test_allowed_message_is_dispatched_and_acked() {
    let h = harness(test_config(&[("orders", &["billing"])]));
    let observer = Arc::new(RecordingMessageObserver::new("billing"));
    h.manager
        .listeners()
        .register_message_observer(Arc::clone(&observer) as Arc<dyn MessageObserver>);
    h.manager.update().await;

    let connection = h.dialer.last_connection().unwrap();
    let channel = consume_channel(&connection, "orders").await;
    let acker = channel.deliver(Some("billing"), b"order payload").await;

    assert!(
        wait_until(Duration::from_secs(2), || observer.received().len() == 1).await,
        "message never reached the observer"
    );
    let received = observer.received();
    assert_eq!(received[0].app_id, "billing");
    assert_eq!(received[0].queue_name, "orders");
    assert_eq!(received[0].body, b"order payload");
    assert_eq!(acker.ack_count(), 1);
}

#[tokio::test]
async fn test_unlisted_app_id_is_acked_and_dropped() {
    let h = harness(test_config(&[("orders", &["billing"])]));
    let observer = Arc::new(RecordingMessageObserver::new("billing"));
    h.manager
        .listeners()
        .register_message_observer(Arc::clone(&observer) as Arc<dyn MessageObserver>);
    h.manager.update().await;

    let connection = h.dialer.last_connection().unwrap();
    let channel = consume_channel(&connection, "orders").await;
    let acker = channel.deliver(Some("intruder"), b"ignored").await;

    assert!(
        wait_until(Duration::from_secs(2), || acker.ack_count() == 1).await,
        "dropped message was never acked"
    );
    assert!(observer.received().is_empty());
}

#[tokio::test]
async fn test_message_without_app_id_is_acked_and_dropped() {
    let h = harness(test_config(&[("orders", &["billing"])]));
    let observer = Arc::new(RecordingMessageObserver::new("billing"));
    h.manager
        .listeners()
        .register_message_observer(Arc::clone(&observer) as Arc<dyn MessageObserver>);
    h.manager.update().await;

    let connection = h.dialer.last_connection().unwrap();
    let channel = consume_channel(&connection, "orders").await;
    let acker = channel.deliver(None, b"anonymous").await;

    assert!(
        wait_until(Duration::from_secs(2), || acker.ack_count() == 1).await,
        "dropped message was never acked"
    );
    assert!(observer.received().is_empty());
}

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let h = harness(test_config(&[("orders", &["billing"])]));
    let observer = Arc::new(RecordingMessageObserver::new("billing"));
    h.manager
        .listeners()
        .register_message_observer(Arc::clone(&observer) as Arc<dyn MessageObserver>);
    h.manager.update().await;

    let connection = h.dialer.last_connection().unwrap();
    let channel = consume_channel(&connection, "orders").await;
    for i in 0..5u8 {
        channel.deliver(Some("billing"), &[i]).await;
    }

    assert!(
        wait_until(Duration::from_secs(2), || observer.received().len() == 5).await,
        "not all messages were dispatched"
    );
    let bodies: Vec<Vec<u8>> = observer.received().iter().map(|m| m.body.clone()).collect();
    assert_eq!(bodies, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
}

#[tokio::test]
async fn test_each_delivery_is_acked_exactly_once() {
    let h = harness(test_config(&[("orders", &["billing"])]));
    let observer = Arc::new(RecordingMessageObserver::new("billing"));
    h.manager
        .listeners()
        .register_message_observer(Arc::clone(&observer) as Arc<dyn MessageObserver>);
    h.manager.update().await;

    let connection = h.dialer.last_connection().unwrap();
    let channel = consume_channel(&connection, "orders").await;
    let first = channel.deliver(Some("billing"), b"one").await;
    let second = channel.deliver(Some("billing"), b"two").await;

    assert!(
        wait_until(Duration::from_secs(2), || observer.received().len() == 2).await,
        "messages never dispatched"
    );
    assert_eq!(first.ack_count(), 1);
    assert_eq!(second.ack_count(), 1);
}

#[tokio::test]
async fn test_debug_messages_bypass_allow_list_in_debug_mode() {
    // The debug id is not in the permitted set; debug mode dispatches it
    // anyway.
    let mut config = test_config(&[("orders", &["billing"])]);
    config.debug = true;
    let h = harness(config);
    let observer = Arc::new(RecordingMessageObserver::new(DEBUG_APP_ID));
    h.manager
        .listeners()
        .register_message_observer(Arc::clone(&observer) as Arc<dyn MessageObserver>);
    h.manager.update().await;

    let connection = h.dialer.last_connection().unwrap();
    let channel = consume_channel(&connection, "orders").await;
    channel.deliver(Some(DEBUG_APP_ID), b"debug probe").await;

    assert!(
        wait_until(Duration::from_secs(2), || observer.received().len() == 1).await,
        "debug message never dispatched in debug mode"
    );
}

#[tokio::test]
async fn test_debug_messages_dropped_outside_debug_mode() {
    // Debug mode off: debug-tagged messages are acked and discarded even
    // when the debug id is listed.
    let h = harness(test_config(&[("orders", &["billing", DEBUG_APP_ID])]));
    let observer = Arc::new(RecordingMessageObserver::new(DEBUG_APP_ID));
    h.manager
        .listeners()
        .register_message_observer(Arc::clone(&observer) as Arc<dyn MessageObserver>);
    h.manager.update().await;

    let connection = h.dialer.last_connection().unwrap();
    let channel = consume_channel(&connection, "orders").await;
    let acker = channel.deliver(Some(DEBUG_APP_ID), b"debug probe").await;

    assert!(
        wait_until(Duration::from_secs(2), || acker.ack_count() == 1).await,
        "debug message was never acked"
    );
    assert!(observer.received().is_empty());
}

#[tokio::test]
async fn test_failing_observer_does_not_block_others() {
    let h = harness(test_config(&[("orders", &["billing"])]));
    let failing = Arc::new(FailingMessageObserver::new("billing"));
    let recording = Arc::new(RecordingMessageObserver::new("billing"));
    h.manager
        .listeners()
        .register_message_observer(Arc::clone(&failing) as Arc<dyn MessageObserver>);
    h.manager
        .listeners()
        .register_message_observer(Arc::clone(&recording) as Arc<dyn MessageObserver>);
    h.manager.update().await;

    let connection = h.dialer.last_connection().unwrap();
    let channel = consume_channel(&connection, "orders").await;
    let acker = channel.deliver(Some("billing"), b"payload").await;

    assert!(
        wait_until(Duration::from_secs(2), || recording.received().len() == 1).await,
        "second observer never received the message"
    );
    assert!(failing.call_count() >= 1);
    assert_eq!(acker.ack_count(), 1);
}

#[tokio::test]
async fn test_bind_and_unbind_follow_channel_lifecycle() {
    let h = harness(test_config(&[("orders", &["billing"])]));
    let observer = Arc::new(RecordingMessageObserver::new("billing"));
    h.manager
        .listeners()
        .register_message_observer(Arc::clone(&observer) as Arc<dyn MessageObserver>);

    h.manager.update().await;
    assert_eq!(observer.bound_queues(), vec!["orders".to_string()]);
    assert!(observer.unbound_queues().is_empty());

    h.manager.shutdown_with_wait().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || observer.unbound_queues().len() == 1).await,
        "unbind never fired after shutdown"
    );
    assert_eq!(observer.unbound_queues(), vec!["orders".to_string()]);
}
