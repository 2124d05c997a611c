//! In-process pub/sub hub for job-finished notifications.
//!
//! Topic-keyed broadcast channels carrying job ids. The in-memory queue uses
//! it the way the Postgres queue uses `LISTEN job_finished`.
//!
//! # Usage
//!
//! Producers:
//!   hub.publish("job_finished", job_id).await;
//!
//! Consumers:
//!   let rx = hub.subscribe("job_finished").await;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Thread-safe, cloneable hub keyed by string topics.
#[derive(Clone)]
pub struct NotificationHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Uuid>>>>,
    capacity: usize,
}

impl NotificationHub {
    /// Create a new hub with default capacity (1024 messages per channel).
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Publish an id to a topic. No-op if no subscribers.
    pub async fn publish(&self, topic: &str, id: Uuid) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(topic) {
            // Ignore send errors (no active receivers)
            let _ = tx.send(id);
        }
    }

    /// Subscribe to a topic. Creates the channel if it doesn't exist.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Uuid> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Remove channels with zero subscribers (housekeeping).
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}
