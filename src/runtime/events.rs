//! Event replies.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::items::ConfigUpdate;
use crate::error::Result;

/// Trait for publishing replies to handled events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Replies to an event once it has been handled.
    async fn reply(&self, event: &ConfigUpdate) -> Result<()>;
}

/// Publisher that keeps replies in memory.
#[derive(Debug, Default)]
pub struct MemoryEventBus {
    replies: Mutex<Vec<ConfigUpdate>>,
}

impl MemoryEventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies published so far.
    pub async fn replies(&self) -> Vec<ConfigUpdate> {
        self.replies.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn reply(&self, event: &ConfigUpdate) -> Result<()> {
        debug!("Reply to event {}", event.id);
        self.replies.lock().await.push(event.clone());
        Ok(())
    }
}
