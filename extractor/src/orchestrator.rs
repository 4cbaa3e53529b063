use crate::events::{Broadcaster, EventBroadcaster};
use crate::fetch::{PageFetcher, RateLimiter};
use crate::model::{Cursor, ExtractionRequest, SourceKind};
use crate::paginate::{IterationFailure, PageIterator, Progress, Termination};
use crate::sink::BatchSink;
use chrono::{DateTime, Utc};
use extractor_core::config::ExtractConfig;
use extractor_core::Error;
use futures::stream::{self, StreamExt};
use metrics::counter;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Terminal status of one extraction job.
#[derive(Debug)]
pub enum ExtractionStatus {
    /// Pagination finished after at least one page; carries the records fetched.
    Completed(usize),
    /// The first request already signalled there was nothing to fetch.
    CompletedEmpty,
    Failed(Box<JobFailure>),
}

impl ExtractionStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, ExtractionStatus::Failed(_))
    }

    fn outcome(&self) -> &'static str {
        match self {
            ExtractionStatus::Completed(_) => "completed",
            ExtractionStatus::CompletedEmpty => "empty",
            ExtractionStatus::Failed(_) => "failed",
        }
    }
}

/// Where a job stopped, so a later run can pick up near that point.
#[derive(Debug)]
pub struct JobFailure {
    pub source: SourceKind,
    pub owner: String,
    pub repo: Option<String>,
    pub entity: String,
    pub cursor: Cursor,
    pub pages_fetched: u32,
    pub records_sunk: usize,
    pub error: Error,
}

impl JobFailure {
    fn new(request: &ExtractionRequest, progress: Progress, error: Error) -> Self {
        Self {
            source: request.source,
            owner: request.owner.clone(),
            repo: request.repo.clone(),
            entity: request.entity.clone(),
            cursor: progress.cursor,
            pages_fetched: progress.pages_fetched,
            records_sunk: progress.records_sunk,
            error,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match &self.repo {
            Some(repo) => format!("{}/{}", self.owner, repo),
            None => self.owner.clone(),
        };
        write!(
            f,
            "{} {} {} failed at {} after {} pages ({} records sunk): {}",
            self.source, scope, self.entity, self.cursor, self.pages_fetched, self.records_sunk, self.error
        )
    }
}

/// Wires fetcher, sink, broadcaster and rate limiter together and runs
/// extraction jobs against them.
pub struct ExtractorOrchestrator {
    fetcher: Arc<dyn PageFetcher>,
    sink: Arc<dyn BatchSink>,
    broadcaster: Arc<dyn Broadcaster>,
    limiter: RateLimiter,
    settings: ExtractConfig,
    cancel: CancellationToken,
}

impl ExtractorOrchestrator {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        sink: Arc<dyn BatchSink>,
        broadcaster: Arc<dyn Broadcaster>,
        limiter: RateLimiter,
        settings: ExtractConfig,
    ) -> Self {
        Self {
            fetcher,
            sink,
            broadcaster,
            limiter,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, request: &ExtractionRequest) -> ExtractionStatus {
        self.run_at(request, Utc::now()).await
    }

    /// Runs one job; `fetched_at` stamps every event it emits.
    #[instrument(skip(self, request), fields(source = %request.source, scope = %request.scope(), entity = %request.entity))]
    pub async fn run_at(&self, request: &ExtractionRequest, fetched_at: DateTime<Utc>) -> ExtractionStatus {
        info!(endpoint = %request.endpoint, page_size = request.page_size, "Starting extraction");

        let events = EventBroadcaster::for_request(
            self.broadcaster.clone(),
            request,
            fetched_at,
            self.settings.event_batch_size,
        );

        let result = PageIterator::new(
            request,
            self.fetcher.as_ref(),
            self.sink.as_ref(),
            &self.limiter,
            &self.settings,
        )
        .with_events(events)
        .with_cancellation(self.cancel.clone())
        .run()
        .await;

        let status = match result {
            Ok((Termination::NoData, _)) => {
                info!("No data found for request");
                ExtractionStatus::CompletedEmpty
            }
            Ok((Termination::Exhausted, progress)) => {
                info!(
                    pages = progress.pages_fetched,
                    records = progress.records_fetched,
                    written = progress.records_sunk,
                    duplicates = progress.duplicates,
                    events = progress.events_emitted,
                    "Extraction completed"
                );
                ExtractionStatus::Completed(progress.records_fetched)
            }
            Err(IterationFailure { error, progress }) => {
                let failure = JobFailure::new(request, progress, error);
                match failure.error.retry_at() {
                    Some(retry_at) => warn!(%retry_at, "{failure}"),
                    None => error!("{failure}"),
                }
                ExtractionStatus::Failed(Box::new(failure))
            }
        };

        counter!("extractor_jobs", "outcome" => status.outcome()).increment(1);
        status
    }

    /// Runs independent jobs concurrently, at most `max_concurrent_jobs` at a
    /// time. Statuses come back in completion order.
    pub async fn run_all(&self, requests: Vec<ExtractionRequest>) -> Vec<(ExtractionRequest, ExtractionStatus)> {
        let limit = self.settings.max_concurrent_jobs.max(1);
        info!(jobs = requests.len(), limit, "Running extraction jobs");

        stream::iter(requests)
            .map(|request| async move {
                let status = self.run(&request).await;
                (request, status)
            })
            .buffer_unordered(limit)
            .collect()
            .await
    }
}
