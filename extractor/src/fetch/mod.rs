pub mod http;
pub mod rate_limit;

use crate::model::{Cursor, ExtractionRequest, FetchOutcome};
use async_trait::async_trait;
use extractor_core::Result;

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch and classify the page at `cursor` for `request`.
    ///
    /// Status-level outcomes (empty, rate limited, unexpected status) come
    /// back as `Ok(FetchOutcome)`; `Err` is reserved for transport failures
    /// and bodies that cannot be understood.
    async fn fetch_page(&self, request: &ExtractionRequest, cursor: Cursor) -> Result<FetchOutcome>;
}

pub use http::{Credentials, HttpPageFetcher};
pub use rate_limit::{RateLimitStatus, RateLimiter};
