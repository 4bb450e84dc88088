//! Consume channel reconciliation tests: config-driven channel creation,
//! removal, and idempotent repeated updates.

use rmq_consumer::broker::BrokerChannel;
use std::collections::HashSet;
use std::time::Duration;

mod test_helpers;
use test_helpers::{consume_channel, harness, test_config, wait_until};

#[tokio::test]
async fn test_channels_start_for_each_configured_queue() {
    let h = harness(test_config(&[
        ("orders", &["billing", "audit"]),
        ("jobs", &["ci"]),
    ]));
    h.manager.update().await;

    let status = h.manager.channel_status().await;
    assert_eq!(status.len(), 2);
    assert_eq!(status.get("orders"), Some(&true));
    assert_eq!(status.get("jobs"), Some(&true));

    let connection = h.dialer.last_connection().unwrap();
    let consumed: HashSet<String> = connection
        .channels()
        .iter()
        .filter_map(|c| c.consumed_queue())
        .collect();
    assert!(consumed.contains("orders"));
    assert!(consumed.contains("jobs"));
}

#[tokio::test]
async fn test_repeated_update_is_idempotent() {
    let h = harness(test_config(&[("orders", &["billing"])]));
    h.manager.update().await;

    let connection = h.dialer.last_connection().unwrap();
    let channels_before = connection.channels().len();

    h.manager.update().await;
    h.manager.update().await;

    assert_eq!(connection.channels().len(), channels_before);
    assert_eq!(h.dialer.dial_count(), 1);
    assert_eq!(h.manager.channel_status().await.get("orders"), Some(&true));
}

#[tokio::test]
async fn test_added_queue_gets_a_channel() {
    let h = harness(test_config(&[("orders", &["billing"])]));
    h.manager.update().await;

    h.store
        .replace(test_config(&[("orders", &["billing"]), ("jobs", &["ci"])]));
    h.manager.update().await;

    let status = h.manager.channel_status().await;
    assert_eq!(status.len(), 2);
    assert_eq!(status.get("jobs"), Some(&true));
    assert_eq!(h.dialer.dial_count(), 1);
}

#[tokio::test]
async fn test_removed_queue_channel_is_stopped() {
    let h = harness(test_config(&[("orders", &["billing"]), ("jobs", &["ci"])]));
    h.manager.update().await;
    let connection = h.dialer.last_connection().unwrap();
    let jobs_channel = consume_channel(&connection, "jobs").await;

    h.store.replace(test_config(&[("orders", &["billing"])]));
    h.manager.update().await;

    let status = h.manager.channel_status().await;
    assert_eq!(status.len(), 1);
    assert!(status.contains_key("orders"));
    assert!(!jobs_channel.is_open());
}

#[tokio::test]
async fn test_changed_allow_list_recreates_channel() {
    let h = harness(test_config(&[("orders", &["billing"])]));
    h.manager.update().await;
    let connection = h.dialer.last_connection().unwrap();
    let old_channel = consume_channel(&connection, "orders").await;

    h.store
        .replace(test_config(&[("orders", &["billing", "audit"])]));
    h.manager.update().await;

    assert!(!old_channel.is_open());
    assert_eq!(h.manager.channel_status().await.get("orders"), Some(&true));

    // A fresh channel consumes the queue now.
    let open_consumers = connection
        .channels()
        .into_iter()
        .filter(|c| c.consumed_queue().as_deref() == Some("orders") && c.is_open())
        .count();
    assert_eq!(open_consumers, 1);
}

#[tokio::test]
async fn test_failed_consume_is_retried_on_next_update() {
    let h = harness(test_config(&[]));
    h.manager.update().await;
    let connection = h.dialer.last_connection().unwrap();

    // Channel creation fails while the queue is first reconciled.
    connection.fail_channel_creation();
    h.store.replace(test_config(&[("orders", &["billing"])]));
    h.manager.update().await;
    assert!(h.manager.channel_status().await.is_empty());

    // Broker recovers; the next update brings the consumer up.
    connection.allow_channel_creation();
    h.manager.update().await;
    assert_eq!(h.manager.channel_status().await.get("orders"), Some(&true));
}

#[tokio::test]
async fn test_remote_close_stops_all_channels() {
    let h = harness(test_config(&[("orders", &["billing"]), ("jobs", &["ci"])]));
    h.manager.update().await;
    let connection = h.dialer.last_connection().unwrap();

    connection.trigger_remote_close("connection_forced");

    assert!(
        wait_until(Duration::from_secs(2), || !h.manager.is_open()).await,
        "manager never observed the remote close"
    );
    assert!(h.manager.channel_status().await.is_empty());
    assert!(connection.channels().iter().all(|c| !c.is_open()));
}
