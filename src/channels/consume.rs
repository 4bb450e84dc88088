//! Per-queue consume channel with single-worker dispatch.
//!
//! Each channel owns one broker channel, one pump task that filters and acks
//! deliveries, and one dispatch worker that runs observer callbacks. The
//! dispatch worker is the only task that invokes `on_receive`, so messages
//! from a queue reach observers strictly in arrival order.

use super::shutdown::ShutdownPolicy;
use crate::broker::{BrokerChannel, DeliveredMessage, InboundDelivery, DEBUG_APP_ID};
use crate::listeners::ListenerRegistry;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Backpressure bound between the pump and the dispatch worker.
const DISPATCH_BUFFER: usize = 16;

struct Workers {
    pump: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Consumes one queue and feeds matching messages to registered observers.
pub struct ConsumeChannel {
    queue_name: String,
    app_ids: HashSet<String>,
    channel: Arc<dyn BrokerChannel>,
    listeners: Arc<ListenerRegistry>,
    debug: bool,
    started: Arc<AtomicBool>,
    policy: ShutdownPolicy,
    workers: Mutex<Option<Workers>>,
}

impl ConsumeChannel {
    pub fn new(
        queue_name: String,
        app_ids: HashSet<String>,
        channel: Arc<dyn BrokerChannel>,
        listeners: Arc<ListenerRegistry>,
        debug: bool,
    ) -> Self {
        Self {
            queue_name,
            app_ids,
            channel,
            listeners,
            debug,
            started: Arc::new(AtomicBool::new(false)),
            policy: ShutdownPolicy::default(),
            workers: Mutex::new(None),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn app_ids(&self) -> &HashSet<String> {
        &self.app_ids
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Starts consuming. A failure to open the consumer is logged, not
    /// propagated: the watchdog will tear the connection down and rebuild
    /// everything on the next cycle. Calling this on an already-started
    /// channel is a no-op.
    pub async fn consume(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.queue_name, "consume channel already started");
            return;
        }

        let consumer_tag = format!("{}-{}", self.queue_name, Uuid::new_v4());
        let inbound = match self.channel.start_consumer(&self.queue_name, &consumer_tag).await {
            Ok(rx) => rx,
            Err(err) => {
                warn!(queue = %self.queue_name, error = %err, "failed to start consumer");
                self.started.store(false, Ordering::SeqCst);
                return;
            }
        };

        info!(queue = %self.queue_name, consumer_tag = %consumer_tag, "consume channel started");
        self.listeners
            .fire_on_bind(&self.queue_name, &self.app_ids)
            .await;

        let (dispatch_tx, mut dispatch_rx) = mpsc::channel::<DeliveredMessage>(DISPATCH_BUFFER);

        let dispatcher = {
            let listeners = Arc::clone(&self.listeners);
            tokio::spawn(async move {
                while let Some(message) = dispatch_rx.recv().await {
                    listeners.fire_on_receive(&message).await;
                }
            })
        };

        let pump = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.pump(inbound, dispatch_tx).await;
            })
        };

        *self.workers.lock().await = Some(Workers { pump, dispatcher });
    }

    /// Reads inbound deliveries until the stream ends, filtering on app id
    /// and acking exactly once per delivery. Acks happen after the message is
    /// handed to the dispatch queue, so a crash before handoff leaves the
    /// message unacked for redelivery.
    async fn pump(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundDelivery>,
        dispatch_tx: mpsc::Sender<DeliveredMessage>,
    ) {
        while let Some(delivery) = inbound.recv().await {
            let app_id = match &delivery.app_id {
                Some(app_id) => app_id.clone(),
                None => {
                    debug!(queue = %self.queue_name, "dropping delivery without app id");
                    ack(&delivery, &self.queue_name).await;
                    continue;
                }
            };

            if !accepts(&self.app_ids, self.debug, &app_id) {
                debug!(queue = %self.queue_name, app_id = %app_id, "dropping delivery, app id not allowed");
                ack(&delivery, &self.queue_name).await;
                continue;
            }

            let message = DeliveredMessage {
                app_id,
                queue_name: self.queue_name.clone(),
                content_type: delivery.content_type.clone(),
                headers: delivery.headers.clone(),
                body: delivery.body.clone(),
            };
            if dispatch_tx.send(message).await.is_err() {
                // Dispatch worker is gone. Leave the message unacked so the
                // broker redelivers it.
                warn!(queue = %self.queue_name, "dispatch worker gone, stopping pump");
                break;
            }
            ack(&delivery, &self.queue_name).await;
        }

        // One exit path for both local stop and broker-initiated close.
        self.started.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "consume channel stopped");
        self.listeners
            .fire_on_unbind(&self.queue_name, &self.app_ids)
            .await;
    }

    /// Stops consuming and tears down the workers. The dispatch worker gets
    /// a grace period to drain in-flight callbacks before being aborted.
    pub async fn stop(&self) {
        let workers = self.workers.lock().await.take();

        if let Err(err) = self.channel.close().await {
            debug!(queue = %self.queue_name, error = %err, "broker channel close failed");
        }

        if let Some(workers) = workers {
            self.policy.run(&format!("{} pump", self.queue_name), workers.pump).await;
            self.policy
                .run(&format!("{} dispatcher", self.queue_name), workers.dispatcher)
                .await;
        }
    }
}

async fn ack(delivery: &InboundDelivery, queue_name: &str) {
    if let Err(err) = delivery.acker.ack().await {
        warn!(queue = %queue_name, error = %err, "failed to ack delivery");
    }
}

/// A message is dispatched when its app id is on the queue's allow-list.
/// The reserved debug app id bypasses the allow-list entirely, but only
/// while debug mode is on, so debug traffic never reaches observers in
/// production configurations.
fn accepts(app_ids: &HashSet<String>, debug: bool, app_id: &str) -> bool {
    if app_id == DEBUG_APP_ID {
        return debug;
    }
    app_ids.contains(app_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_accepts_listed_app_id() {
        assert!(accepts(&ids(&["app.a", "app.b"]), false, "app.a"));
        assert!(!accepts(&ids(&["app.a"]), false, "app.z"));
    }

    #[test]
    fn test_debug_app_id_requires_debug_mode() {
        // In debug mode the debug id bypasses the allow-list.
        assert!(accepts(&ids(&["app.a"]), true, DEBUG_APP_ID));
        assert!(accepts(&ids(&["app.a", DEBUG_APP_ID]), true, DEBUG_APP_ID));

        // Outside debug mode it never flows, listed or not.
        assert!(!accepts(&ids(&["app.a"]), false, DEBUG_APP_ID));
        assert!(!accepts(&ids(&["app.a", DEBUG_APP_ID]), false, DEBUG_APP_ID));
    }
}
