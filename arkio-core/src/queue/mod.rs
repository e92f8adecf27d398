//! At-least-once work queue boundary.
//!
//! The message body carries only the decimal work-item id; the payload is
//! always re-fetched from the registry. Long-running stages must `touch` the
//! message to extend its visibility, and exactly one terminal stage either
//! `finish`es or `requeue`s it.

pub mod memory;

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemoryQueue;

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub handle: String,
    pub body: String,
}

impl QueueMessage {
    /// Parses the decimal work-item id out of the message body.
    pub fn work_item_id(&self) -> Result<i64> {
        self.body.trim().parse::<i64>().map_err(|_| {
            crate::ArkError::InvalidRequest(format!(
                "malformed work item id in message body: '{}'",
                self.body
            ))
        })
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(&self, body: &str) -> Result<()>;

    /// Receives up to `max` visible messages, making them invisible for the
    /// queue's visibility timeout.
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>>;

    /// Extends the visibility timeout of an in-flight message.
    async fn touch(&self, message: &QueueMessage, extend_by: Duration) -> Result<()>;

    /// Acknowledges a message; it will never be delivered again.
    async fn finish(&self, message: &QueueMessage) -> Result<()>;

    /// Returns a message to the queue after `delay`.
    async fn requeue(&self, message: &QueueMessage, delay: Duration) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_id_parsing() {
        let good = QueueMessage {
            handle: "h1".to_string(),
            body: " 42 ".to_string(),
        };
        assert_eq!(good.work_item_id().unwrap(), 42);

        let bad = QueueMessage {
            handle: "h2".to_string(),
            body: "not-a-number".to_string(),
        };
        let error = bad.work_item_id().unwrap_err();
        assert!(error.is_fatal());
    }
}
