use super::{QueueMessage, WorkQueue};
use crate::{ArkError, Result};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// In-memory queue with faithful at-least-once semantics.
///
/// Unacked messages become visible again once their visibility timeout
/// lapses, so redelivery paths are exercised for real in tests and local
/// clusters.
pub struct MemoryQueue {
    visibility_timeout: Duration,
    entries: Mutex<Vec<Entry>>,
    next_handle: Mutex<u64>,
}

struct Entry {
    handle: String,
    body: String,
    visible_at: Instant,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            entries: Mutex::new(Vec::new()),
            next_handle: Mutex::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocate_handle(&self) -> Result<String> {
        let mut counter = self
            .next_handle
            .lock()
            .map_err(|_| ArkError::Queue("queue lock poisoned".to_string()))?;
        *counter += 1;
        Ok(format!("msg-{}", counter))
    }

    fn lock_entries(&self) -> Result<std::sync::MutexGuard<'_, Vec<Entry>>> {
        self.entries
            .lock()
            .map_err(|_| ArkError::Queue("queue lock poisoned".to_string()))
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, body: &str) -> Result<()> {
        let handle = self.allocate_handle()?;
        let mut entries = self.lock_entries()?;
        entries.push(Entry {
            handle,
            body: body.to_string(),
            visible_at: Instant::now(),
        });
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let now = Instant::now();
        let mut entries = self.lock_entries()?;
        let mut received = Vec::new();

        for entry in entries.iter_mut() {
            if received.len() >= max {
                break;
            }
            if entry.visible_at <= now {
                entry.visible_at = now + self.visibility_timeout;
                received.push(QueueMessage {
                    handle: entry.handle.clone(),
                    body: entry.body.clone(),
                });
            }
        }

        Ok(received)
    }

    async fn touch(&self, message: &QueueMessage, extend_by: Duration) -> Result<()> {
        let mut entries = self.lock_entries()?;
        match entries.iter_mut().find(|entry| entry.handle == message.handle) {
            Some(entry) => {
                entry.visible_at = Instant::now() + extend_by;
                Ok(())
            }
            None => Err(ArkError::Queue(format!(
                "unknown message handle: {}",
                message.handle
            ))),
        }
    }

    async fn finish(&self, message: &QueueMessage) -> Result<()> {
        let mut entries = self.lock_entries()?;
        let before = entries.len();
        entries.retain(|entry| entry.handle != message.handle);
        if entries.len() == before {
            return Err(ArkError::Queue(format!(
                "unknown message handle: {}",
                message.handle
            )));
        }
        Ok(())
    }

    async fn requeue(&self, message: &QueueMessage, delay: Duration) -> Result<()> {
        let mut entries = self.lock_entries()?;
        match entries.iter_mut().find(|entry| entry.handle == message.handle) {
            Some(entry) => {
                entry.visible_at = Instant::now() + delay;
                Ok(())
            }
            None => Err(ArkError::Queue(format!(
                "unknown message handle: {}",
                message.handle
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_hides_message_until_visibility_lapses() {
        let queue = MemoryQueue::new(Duration::from_millis(20));
        queue.send("7").await.unwrap();

        let first = queue.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.receive(10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let redelivered = queue.receive(10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].body, "7");
    }

    #[tokio::test]
    async fn test_finish_acks_exactly_once() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.send("1").await.unwrap();
        let messages = queue.receive(1).await.unwrap();

        queue.finish(&messages[0]).await.unwrap();
        assert!(queue.is_empty());
        assert!(queue.finish(&messages[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_touch_extends_visibility() {
        let queue = MemoryQueue::new(Duration::from_millis(10));
        queue.send("9").await.unwrap();
        let messages = queue.receive(1).await.unwrap();

        queue
            .touch(&messages[0], Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(queue.receive(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_delays_redelivery() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.send("3").await.unwrap();
        let messages = queue.receive(1).await.unwrap();

        queue
            .requeue(&messages[0], Duration::from_millis(25))
            .await
            .unwrap();
        assert!(queue.receive(1).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(queue.receive(1).await.unwrap().len(), 1);
    }
}
