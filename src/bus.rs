//! Topic-based publish/subscribe bus
//!
//! Decouples detectors and the lifecycle manager from report delivery.
//! Every subscriber owns a bounded queue; a publish fans the message out
//! to the subscribers registered at that moment, in registration order.
//! A subscriber that stays full past the delivery timeout gets its copy
//! dead-lettered instead of stalling the publisher.

use crate::dlq::{DeadLetter, DlqHandler};
use crate::error::{Result, WatchError};
use crate::types::{now_millis, Alert};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// Hijack alerts
pub const HIJACK_CHANNEL: &str = "hijack";
/// More-specific (possible reconfiguration) alerts
pub const NEW_PREFIX_CHANNEL: &str = "newprefix";
/// Visibility loss alerts
pub const VISIBILITY_CHANNEL: &str = "visibility";
/// Control channel: payload names a detector to run its self-test
pub const TEST_CHANNEL: &str = "test-type";

/// What a bus message carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "body")]
pub enum Payload {
    /// An alert snapshot from the lifecycle manager
    Alert(Alert),
    /// A control request (detector channel or name)
    Control(String),
}

/// Envelope delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    /// Unique message identifier (msg-<uuid>)
    pub id: String,

    pub channel: String,

    pub payload: Payload,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

impl BusMessage {
    pub fn new(channel: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            channel: channel.into(),
            payload,
            timestamp: now_millis(),
        }
    }

    pub fn alert(&self) -> Option<&Alert> {
        match &self.payload {
            Payload::Alert(alert) => Some(alert),
            Payload::Control(_) => None,
        }
    }

    pub fn control(&self) -> Option<&str> {
        match &self.payload {
            Payload::Control(target) => Some(target),
            Payload::Alert(_) => None,
        }
    }
}

/// Async handle for receiving messages from one channel
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Next message, or `None` once the bus is gone or the subscription removed
    async fn next(&mut self) -> Option<BusMessage>;

    /// Channel this subscription listens on
    fn channel(&self) -> &str;
}

/// Queue-backed subscription returned by `AlertBus::subscribe`
pub struct BusSubscription {
    id: String,
    channel: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl BusSubscription {
    /// Subscriber id, usable with `AlertBus::unsubscribe`
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Non-blocking receive
    pub fn try_next(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }

    /// Consume the subscription as a `Stream`
    pub fn into_stream(self) -> ReceiverStream<BusMessage> {
        ReceiverStream::new(self.rx)
    }
}

#[async_trait]
impl Subscription for BusSubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}

struct Subscriber {
    id: String,
    tx: mpsc::Sender<BusMessage>,
}

/// Bus status information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusInfo {
    /// Channels with at least one subscriber
    pub channels: usize,
    /// Live subscribers across all channels
    pub subscribers: usize,
    /// Messages published (including those with no subscribers)
    pub published: u64,
    /// Per-subscriber deliveries that were dead-lettered
    pub dead_lettered: u64,
}

/// In-process publish/subscribe bus
pub struct AlertBus {
    /// channel → subscribers in registration order
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    capacity: usize,
    delivery_timeout: Duration,
    dlq: Option<Arc<dyn DlqHandler>>,
    published: AtomicU64,
    dead_lettered: AtomicU64,
}

impl AlertBus {
    /// Create a bus whose subscriber queues hold `capacity` messages
    pub fn new(capacity: usize, delivery_timeout: Duration) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            delivery_timeout,
            dlq: None,
            published: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    /// Route undeliverable messages to `handler`
    pub fn set_dlq_handler(&mut self, handler: Arc<dyn DlqHandler>) {
        self.dlq = Some(handler);
    }

    pub fn dlq_handler(&self) -> Option<&Arc<dyn DlqHandler>> {
        self.dlq.as_ref()
    }

    /// Register a queue-backed subscriber on `channel`
    ///
    /// Only messages published after this call returns are received.
    pub async fn subscribe(&self, channel: &str) -> BusSubscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = format!("sub-{}", uuid::Uuid::new_v4());

        {
            let mut subs = self.subscribers.write().await;
            subs.entry(channel.to_string()).or_default().push(Subscriber {
                id: id.clone(),
                tx,
            });
        }

        tracing::debug!(channel = %channel, subscriber = %id, "Subscribed");

        BusSubscription {
            id,
            channel: channel.to_string(),
            rx,
        }
    }

    /// Register a handler run on its own task for every message on `channel`
    ///
    /// Handler errors and panics are logged; the handler keeps receiving.
    pub async fn subscribe_with<F>(&self, channel: &str, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(BusMessage) -> Result<()> + Send + 'static,
    {
        let mut subscription = self.subscribe(channel).await;
        tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                let message_id = message.id.clone();
                match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(
                            channel = %subscription.channel,
                            message_id = %message_id,
                            error = %e,
                            "Subscriber handler failed"
                        );
                    }
                    Err(_) => {
                        tracing::error!(
                            channel = %subscription.channel,
                            message_id = %message_id,
                            "Subscriber handler panicked"
                        );
                    }
                }
            }
        })
    }

    /// Remove a subscriber; returns false if it was not registered
    pub async fn unsubscribe(&self, subscriber_id: &str) -> bool {
        let mut subs = self.subscribers.write().await;
        let mut removed = false;
        for list in subs.values_mut() {
            let before = list.len();
            list.retain(|s| s.id != subscriber_id);
            removed |= list.len() != before;
        }
        subs.retain(|_, list| !list.is_empty());
        removed
    }

    /// Publish `payload` on `channel`
    ///
    /// Returns the number of subscribers the message was delivered to.
    /// Publishing to a channel without subscribers is a no-op.
    pub async fn publish(&self, channel: &str, payload: Payload) -> Result<usize> {
        if channel.is_empty() {
            return Err(WatchError::Publish {
                channel: String::new(),
                reason: "empty channel name".to_string(),
            });
        }

        let message = BusMessage::new(channel, payload);
        self.published.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<(String, mpsc::Sender<BusMessage>)> = {
            let subs = self.subscribers.read().await;
            subs.get(channel)
                .map(|list| list.iter().map(|s| (s.id.clone(), s.tx.clone())).collect())
                .unwrap_or_default()
        };

        if targets.is_empty() {
            tracing::debug!(channel = %channel, "No subscribers, message dropped");
            return Ok(0);
        }

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (subscriber_id, tx) in targets {
            match tx.send_timeout(message.clone(), self.delivery_timeout).await {
                Ok(()) => delivered += 1,
                Err(SendTimeoutError::Closed(_)) => closed.push(subscriber_id),
                Err(SendTimeoutError::Timeout(undelivered)) => {
                    self.dead_letter(undelivered, &subscriber_id, "delivery timed out")
                        .await;
                }
            }
        }

        if !closed.is_empty() {
            let mut subs = self.subscribers.write().await;
            if let Some(list) = subs.get_mut(channel) {
                list.retain(|s| !closed.contains(&s.id));
                if list.is_empty() {
                    subs.remove(channel);
                }
            }
            tracing::debug!(channel = %channel, removed = closed.len(), "Pruned closed subscribers");
        }

        Ok(delivered)
    }

    /// Publish an alert snapshot
    pub async fn publish_alert(&self, channel: &str, alert: Alert) -> Result<usize> {
        self.publish(channel, Payload::Alert(alert)).await
    }

    /// Ask detectors matching `target` to run their self-test
    pub async fn publish_test(&self, target: &str) -> Result<usize> {
        self.publish(TEST_CHANNEL, Payload::Control(target.to_string()))
            .await
    }

    async fn dead_letter(&self, message: BusMessage, subscriber_id: &str, reason: &str) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        match &self.dlq {
            Some(dlq) => {
                if let Err(e) = dlq
                    .handle(DeadLetter::new(message, subscriber_id, reason))
                    .await
                {
                    tracing::warn!(error = %e, "Dead letter handler failed");
                }
            }
            None => {
                tracing::warn!(
                    channel = %message.channel,
                    subscriber = %subscriber_id,
                    reason = %reason,
                    "Message dropped"
                );
            }
        }
    }

    /// Get bus status
    pub async fn info(&self) -> BusInfo {
        let subs = self.subscribers.read().await;
        BusInfo {
            channels: subs.len(),
            subscribers: subs.values().map(Vec::len).sum(),
            published: self.published.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new(1024, Duration::from_secs(5))
    }
}
