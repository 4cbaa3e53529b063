use super::{Broadcaster, DownstreamEvent};
use async_trait::async_trait;
use extractor_core::{Error, Result};
use tokio::sync::mpsc;

/// Publishes onto a bounded tokio channel. Senders block when the consumer
/// falls behind.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    tx: mpsc::Sender<DownstreamEvent>,
}

impl ChannelBroadcaster {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<DownstreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    async fn broadcast(&self, event: DownstreamEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| Error::Broadcast(format!("event channel closed, dropped event {}", e.0.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;
    use chrono::Utc;
    use uuid::Uuid;

    fn event() -> DownstreamEvent {
        DownstreamEvent {
            id: Uuid::new_v4(),
            kind: "issue_comments".to_string(),
            source: SourceKind::Jira,
            owner: "PROJ".to_string(),
            repo: None,
            parent_entity: "issues".to_string(),
            fetched_at: Utc::now(),
            references: vec!["10001".to_string()],
        }
    }

    #[tokio::test]
    async fn delivers_to_receiver() {
        let (broadcaster, mut rx) = ChannelBroadcaster::channel(4);
        let sent = event();
        broadcaster.broadcast(sent.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(sent));
    }

    #[tokio::test]
    async fn closed_channel_is_a_broadcast_error() {
        let (broadcaster, rx) = ChannelBroadcaster::channel(4);
        drop(rx);
        let err = broadcaster.broadcast(event()).await.unwrap_err();
        assert!(matches!(err, Error::Broadcast(_)));
    }
}
