use super::{Broadcaster, DownstreamEvent};
use async_trait::async_trait;
use extractor_core::Result;
use tokio::sync::Mutex;

/// Keeps published events in memory, in publication order.
#[derive(Default)]
pub struct MemoryBroadcaster {
    events: Mutex<Vec<DownstreamEvent>>,
}

impl MemoryBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<DownstreamEvent> {
        self.events.lock().await.clone()
    }

    /// All references across all events, flattened.
    pub async fn references(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .flat_map(|e| e.references.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl Broadcaster for MemoryBroadcaster {
    async fn broadcast(&self, event: DownstreamEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}
