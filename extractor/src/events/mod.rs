//! Downstream events announcing freshly sunk records, so dependent
//! extractions (pull request → its commits, issue → its comments) can be
//! scheduled.

pub mod channel;
pub mod memory;

use crate::model::{field_as_string, ExtractionRequest, Record, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use extractor_core::Result;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub use channel::ChannelBroadcaster;
pub use memory::MemoryBroadcaster;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamEvent {
    pub id: Uuid,
    pub kind: String,
    pub source: SourceKind,
    pub owner: String,
    pub repo: Option<String>,
    /// Entity the references were read from.
    pub parent_entity: String,
    pub fetched_at: DateTime<Utc>,
    pub references: Vec<String>,
}

/// Outbound event channel. Implementations must accept concurrent calls
/// from independent jobs.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, event: DownstreamEvent) -> Result<()>;
}

/// Per-job accumulator of references. Emits one event per
/// `event_batch_size` references and whatever remains on [`finish`].
///
/// [`finish`]: EventBroadcaster::finish
pub struct EventBroadcaster {
    broadcaster: Arc<dyn Broadcaster>,
    field: String,
    kind: String,
    source: SourceKind,
    owner: String,
    repo: Option<String>,
    parent_entity: String,
    fetched_at: DateTime<Utc>,
    threshold: usize,
    pending: Vec<String>,
    emitted: usize,
}

impl EventBroadcaster {
    /// `None` when the request asks for no downstream references.
    pub fn for_request(
        broadcaster: Arc<dyn Broadcaster>,
        request: &ExtractionRequest,
        fetched_at: DateTime<Utc>,
        event_batch_size: usize,
    ) -> Option<Self> {
        let reference = request.reference.as_ref()?;
        Some(Self {
            broadcaster,
            field: reference.field.clone(),
            kind: reference.event_kind.clone(),
            source: request.source,
            owner: request.owner.clone(),
            repo: request.repo.clone(),
            parent_entity: request.entity.clone(),
            fetched_at,
            threshold: event_batch_size.max(1),
            pending: Vec::new(),
            emitted: 0,
        })
    }

    /// Queues references from records that were just sunk, publishing full
    /// events as the threshold is crossed.
    pub async fn collect(&mut self, records: &[Record]) -> Result<()> {
        let before = self.pending.len();
        self.pending
            .extend(records.iter().filter_map(|r| field_as_string(r, &self.field)));

        let missing = records.len() - (self.pending.len() - before);
        if missing > 0 {
            debug!(field = %self.field, missing, "Records without a reference field");
        }

        // References leave `pending` only once their event is out.
        while self.pending.len() >= self.threshold {
            let chunk = self.pending[..self.threshold].to_vec();
            self.emit(chunk).await?;
            self.pending.drain(..self.threshold);
        }
        Ok(())
    }

    /// Publishes any remaining references.
    pub async fn finish(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let rest = self.pending.clone();
        self.emit(rest).await?;
        self.pending.clear();
        Ok(())
    }

    pub fn events_emitted(&self) -> usize {
        self.emitted
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    async fn emit(&mut self, references: Vec<String>) -> Result<()> {
        let event = DownstreamEvent {
            id: Uuid::new_v4(),
            kind: self.kind.clone(),
            source: self.source,
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            parent_entity: self.parent_entity.clone(),
            fetched_at: self.fetched_at,
            references,
        };
        let count = event.references.len();

        self.broadcaster.broadcast(event).await?;
        self.emitted += 1;

        counter!("extractor_events_broadcast", "kind" => self.kind.clone()).increment(1);
        debug!(kind = %self.kind, references = count, "Broadcast downstream event");
        Ok(())
    }
}
