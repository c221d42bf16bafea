//! Dead letter queue for undeliverable bus messages
//!
//! When a subscriber queue stays full past the delivery timeout, the bus
//! hands the message to a `DlqHandler` instead of blocking detection.

use crate::bus::BusMessage;
use crate::error::Result;
use crate::types::now_millis;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A message that could not be delivered to one subscriber
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The undelivered message
    pub message: BusMessage,

    /// Subscriber that did not accept it
    pub subscriber_id: String,

    /// Why delivery failed
    pub reason: String,

    /// Unix timestamp in milliseconds
    pub dead_lettered_at: u64,
}

impl DeadLetter {
    pub fn new(
        message: BusMessage,
        subscriber_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            message,
            subscriber_id: subscriber_id.into(),
            reason: reason.into(),
            dead_lettered_at: now_millis(),
        }
    }
}

/// Trait for dead letter handlers
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Take ownership of an undelivered message
    async fn handle(&self, letter: DeadLetter) -> Result<()>;

    /// Number of letters currently held
    async fn count(&self) -> Result<usize>;

    /// Most recent letters first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// In-memory handler keeping at most `max_letters` entries
pub struct MemoryDlqHandler {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
    max_letters: usize,
}

impl MemoryDlqHandler {
    pub fn new(max_letters: usize) -> Self {
        Self {
            letters: Arc::new(RwLock::new(Vec::new())),
            max_letters,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            message_id = %letter.message.id,
            channel = %letter.message.channel,
            subscriber = %letter.subscriber_id,
            reason = %letter.reason,
            "Message dead-lettered"
        );

        let mut letters = self.letters.write().await;
        letters.push(letter);

        if self.max_letters > 0 && letters.len() > self.max_letters {
            let drain_count = letters.len() - self.max_letters;
            letters.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.letters.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let letters = self.letters.read().await;
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, Payload, TEST_CHANNEL};

    fn letter(reason: &str) -> DeadLetter {
        DeadLetter::new(
            BusMessage::new(TEST_CHANNEL, Payload::Control("hijack".to_string())),
            "sub-1",
            reason,
        )
    }

    #[test]
    fn test_dead_letter_creation() {
        let dl = letter("delivery timed out");
        assert_eq!(dl.reason, "delivery timed out");
        assert_eq!(dl.subscriber_id, "sub-1");
        assert!(dl.dead_lettered_at > 0);
    }

    #[tokio::test]
    async fn test_memory_dlq_handle_and_list() {
        let dlq = MemoryDlqHandler::default();
        assert_eq!(dlq.count().await.unwrap(), 0);

        for i in 0..5 {
            dlq.handle(letter(&format!("reason {}", i))).await.unwrap();
        }

        assert_eq!(dlq.count().await.unwrap(), 5);
        let list = dlq.list(3).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].reason, "reason 4");
        assert_eq!(list[2].reason, "reason 2");
    }

    #[tokio::test]
    async fn test_memory_dlq_max_capacity() {
        let dlq = MemoryDlqHandler::new(3);
        for i in 0..5 {
            dlq.handle(letter(&format!("reason {}", i))).await.unwrap();
        }
        assert_eq!(dlq.count().await.unwrap(), 3);
        let list = dlq.list(10).await.unwrap();
        assert_eq!(list[0].reason, "reason 4");
        assert_eq!(list[2].reason, "reason 2");
    }
}
