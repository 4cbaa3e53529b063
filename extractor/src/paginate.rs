use crate::batch::Batch;
use crate::events::EventBroadcaster;
use crate::fetch::{PageFetcher, RateLimiter};
use crate::model::{Cursor, ExtractionRequest, FetchOutcome, Page, Record};
use crate::sink::BatchSink;
use chrono::Utc;
use extractor_core::backoff::retry_with_backoff;
use extractor_core::config::ExtractConfig;
use extractor_core::{Error, Result};
use metrics::counter;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where one job's pagination loop currently stands.
#[derive(Debug)]
enum State {
    Fetching(Cursor),
    Accumulating(Page),
    /// Sink the batch, then fetch `next` or stop.
    Flushing { next: Option<Cursor> },
    Done(Termination),
}

/// How a job's pagination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// At least one page came back before the listing ended.
    Exhausted,
    /// The very first request ended the listing.
    NoData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Cursor of the most recent request.
    pub cursor: Cursor,
    pub pages_fetched: u32,
    pub records_fetched: usize,
    pub records_sunk: usize,
    pub duplicates: usize,
    pub sink_calls: usize,
    pub events_emitted: usize,
}

/// Error that stopped a job, with how far it got.
#[derive(Debug)]
pub struct IterationFailure {
    pub error: Error,
    pub progress: Progress,
}

/// Drives fetch, accumulate and flush for a single request, strictly in
/// cursor order.
pub struct PageIterator<'a> {
    request: &'a ExtractionRequest,
    fetcher: &'a dyn PageFetcher,
    sink: &'a dyn BatchSink,
    limiter: &'a RateLimiter,
    settings: &'a ExtractConfig,
    cancel: CancellationToken,
    events: Option<EventBroadcaster>,
    batch: Batch,
    progress: Progress,
}

impl<'a> PageIterator<'a> {
    pub fn new(
        request: &'a ExtractionRequest,
        fetcher: &'a dyn PageFetcher,
        sink: &'a dyn BatchSink,
        limiter: &'a RateLimiter,
        settings: &'a ExtractConfig,
    ) -> Self {
        let cursor = crate::source::dialect(request.source).initial_cursor();
        Self {
            request,
            fetcher,
            sink,
            limiter,
            settings,
            cancel: CancellationToken::new(),
            events: None,
            batch: Batch::new(settings.max_batch_size),
            progress: Progress {
                cursor,
                pages_fetched: 0,
                records_fetched: 0,
                records_sunk: 0,
                duplicates: 0,
                sink_calls: 0,
                events_emitted: 0,
            },
        }
    }

    pub fn with_events(mut self, events: Option<EventBroadcaster>) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the loop to completion. On failure, records already fetched are
    /// flushed once and pending references broadcast before returning.
    pub async fn run(mut self) -> std::result::Result<(Termination, Progress), IterationFailure> {
        match self.drive().await {
            Ok(termination) => match self.finish().await {
                Ok(()) => Ok((termination, self.progress)),
                Err(error) => Err(IterationFailure {
                    error,
                    progress: self.progress,
                }),
            },
            Err(error) => {
                self.salvage().await;
                Err(IterationFailure {
                    error,
                    progress: self.progress,
                })
            }
        }
    }

    async fn drive(&mut self) -> Result<Termination> {
        let mut state = State::Fetching(self.progress.cursor);

        loop {
            state = match state {
                State::Fetching(cursor) => {
                    self.progress.cursor = cursor;
                    match self.fetch(cursor).await? {
                        FetchOutcome::Page(page) => State::Accumulating(page),
                        FetchOutcome::EmptyTerminal if self.progress.pages_fetched == 0 => {
                            State::Done(Termination::NoData)
                        }
                        FetchOutcome::EmptyTerminal => State::Done(Termination::Exhausted),
                        FetchOutcome::Fatal { status, body } => {
                            return Err(Error::UnknownHttpStatus { status, body });
                        }
                        FetchOutcome::RateLimited { reset_at } => {
                            return Err(Error::RateLimitExceeded { reset_at });
                        }
                    }
                }
                State::Accumulating(page) => {
                    let count = page.records.len();
                    self.progress.pages_fetched += 1;
                    self.progress.records_fetched += count;
                    self.batch.extend(page.records);

                    let next = if page.is_last || count == 0 {
                        None
                    } else {
                        Some(page.cursor.advance(count))
                    };

                    debug!(
                        cursor = %page.cursor,
                        records = count,
                        is_last = page.is_last,
                        pending = self.batch.len(),
                        "Accumulated page"
                    );

                    if self.batch.should_flush() {
                        State::Flushing { next }
                    } else {
                        match next {
                            Some(cursor) => State::Fetching(cursor),
                            None => State::Done(Termination::Exhausted),
                        }
                    }
                }
                State::Flushing { next } => {
                    self.flush().await?;
                    match next {
                        Some(cursor) => State::Fetching(cursor),
                        None => State::Done(Termination::Exhausted),
                    }
                }
                State::Done(termination) => return Ok(termination),
            };
        }
    }

    /// One page, with transport retries and, under the `Wait` policy,
    /// sleeps until the quota resets.
    async fn fetch(&mut self, cursor: Cursor) -> Result<FetchOutcome> {
        let fetcher = self.fetcher;
        let request = self.request;
        let mut waited = Duration::ZERO;
        let mut rate_limited = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.limiter.until_ready().await;

            let outcome = retry_with_backoff(
                || fetcher.fetch_page(request, cursor),
                Error::is_retryable,
                self.settings.max_retries,
                self.settings.retry_base_delay_ms,
                "fetch_page",
            )
            .await?;

            let reset_at = match outcome {
                FetchOutcome::RateLimited { reset_at } => reset_at,
                other => return Ok(other),
            };

            rate_limited += 1;

            let wait = self.limiter.on_rate_limited(reset_at, waited, Utc::now())?;
            if rate_limited > self.settings.max_retries {
                warn!(%cursor, attempts = rate_limited, "Still rate limited, giving up");
                return Err(Error::RateLimitExceeded { reset_at });
            }

            info!(
                source = %request.source,
                %cursor,
                reset_at = %reset_at,
                wait_secs = wait.as_secs(),
                "Rate limited, waiting for quota reset"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            waited += wait;
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let records = self.batch.take();
        self.sink_records(&records).await?;

        if let Some(events) = self.events.as_mut() {
            events.collect(&records).await?;
            self.progress.events_emitted = events.events_emitted();
        }
        Ok(())
    }

    async fn sink_records(&mut self, records: &[Record]) -> Result<()> {
        let sink = self.sink;
        let request = self.request;

        let receipt = retry_with_backoff(
            || sink.sink(request, records),
            Error::is_retryable,
            self.settings.max_retries,
            self.settings.retry_base_delay_ms,
            "sink_batch",
        )
        .await
        .map_err(|e| match e {
            Error::SinkWrite(_) => e,
            other => Error::SinkWrite(other.to_string()),
        })?;

        self.progress.sink_calls += 1;
        self.progress.records_sunk += receipt.written;
        self.progress.duplicates += receipt.duplicates;

        let entity = request.entity.clone();
        counter!("extractor_records_sunk", "entity" => entity.clone()).increment(receipt.written as u64);
        if receipt.duplicates > 0 {
            counter!("extractor_duplicate_records", "entity" => entity).increment(receipt.duplicates as u64);
        }

        debug!(
            records = records.len(),
            written = receipt.written,
            duplicates = receipt.duplicates,
            "Flushed batch"
        );
        Ok(())
    }

    /// Terminal flush and final event emission after a clean end.
    async fn finish(&mut self) -> Result<()> {
        self.flush().await?;
        if let Some(events) = self.events.as_mut() {
            events.finish().await?;
            self.progress.events_emitted = events.events_emitted();
        }
        Ok(())
    }

    /// Best-effort cleanup after an error. Failures here are logged, never
    /// allowed to replace the original error.
    async fn salvage(&mut self) {
        if !self.batch.is_empty() {
            let pending = self.batch.len();
            if let Err(e) = self.flush().await {
                warn!(error = %e, pending, "Could not flush records fetched before the failure");
            }
        }
        if let Some(events) = self.events.as_mut() {
            if let Err(e) = events.finish().await {
                warn!(error = %e, "Could not broadcast pending references");
            }
            self.progress.events_emitted = events.events_emitted();
        }
    }
}
