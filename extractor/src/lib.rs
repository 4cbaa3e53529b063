pub mod app;
pub mod batch;
pub mod events;
pub mod fetch;
pub mod model;
pub mod orchestrator;
pub mod paginate;
pub mod sink;
pub mod source;

#[cfg(test)]
mod testing;

pub use events::{Broadcaster, DownstreamEvent, EventBroadcaster};
pub use fetch::{HttpPageFetcher, PageFetcher, RateLimiter};
pub use model::{Cursor, ExtractionRequest, FetchOutcome, Page, Record, SourceKind};
pub use orchestrator::{ExtractionStatus, ExtractorOrchestrator, JobFailure};
pub use sink::{BatchSink, SinkReceipt};
