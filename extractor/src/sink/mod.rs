pub mod memory;
pub mod postgres;

use crate::model::{ExtractionRequest, Record};
use async_trait::async_trait;
use extractor_core::Result;

pub use memory::MemorySink;
pub use postgres::{Checkpoint, PostgresSink};

/// What a sink did with one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReceipt {
    pub written: usize,
    /// Records already present and skipped under `DuplicatePolicy::Skip`.
    pub duplicates: usize,
}

/// Durable destination for extracted records. Implementations must accept
/// concurrent calls from independent jobs.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Persist `records`, which belong to `request`. A failure aborts the
    /// job and is surfaced as `SinkWrite`.
    async fn sink(&self, request: &ExtractionRequest, records: &[Record]) -> Result<SinkReceipt>;
}
