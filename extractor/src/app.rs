use crate::events::{ChannelBroadcaster, DownstreamEvent};
use crate::fetch::{HttpPageFetcher, RateLimiter};
use crate::model::ExtractionRequest;
use crate::orchestrator::{ExtractionStatus, ExtractorOrchestrator};
use crate::sink::{Checkpoint, PostgresSink};
use chrono::Utc;
use extractor_core::{Config, Result};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

pub struct App {
    store: Arc<PostgresSink>,
    orchestrator: ExtractorOrchestrator,
    event_logger: JoinHandle<usize>,
}

impl App {
    #[instrument(skip(config, pool, cancel))]
    pub async fn new(config: Config, pool: PgPool, cancel: CancellationToken) -> Result<Self> {
        info!("Initializing application");

        let store = Arc::new(PostgresSink::new(pool, config.extract.duplicates));

        info!("Performing health checks");
        store.health_check().await?;

        let fetcher = HttpPageFetcher::from_config(&config)?;
        let limiter = RateLimiter::new(config.extract.rate_limit)
            .with_pacing(config.http.requests_per_second);

        let (broadcaster, events) = ChannelBroadcaster::channel(config.events.channel_buffer_size);
        let event_logger = tokio::spawn(log_events(events));

        let orchestrator = ExtractorOrchestrator::new(
            Arc::new(fetcher),
            store.clone(),
            Arc::new(broadcaster),
            limiter,
            config.extract.clone(),
        )
        .with_cancellation(cancel);

        Ok(Self {
            store,
            orchestrator,
            event_logger,
        })
    }

    /// Runs one request. Without an explicit `since`, the window resumes
    /// from the last successful run; the checkpoint moves only on success.
    #[instrument(skip(self, request), fields(scope = %request.scope(), entity = %request.entity))]
    pub async fn extract(&self, request: ExtractionRequest) -> Result<ExtractionStatus> {
        let mut request = request;
        if request.window.since.is_none() {
            let checkpoint = self
                .store
                .get_checkpoint(request.source, &request.owner, request.repo.as_deref(), &request.entity)
                .await?;
            if let Some(checkpoint) = checkpoint {
                info!(since = %checkpoint.last_fetched_at, "Resuming from checkpoint");
                request.window.since = Some(checkpoint.last_fetched_at);
            }
        }

        let started_at = Utc::now();
        let status = self.orchestrator.run_at(&request, started_at).await;

        let extracted = match &status {
            ExtractionStatus::Completed(records) => Some(*records),
            ExtractionStatus::CompletedEmpty => Some(0),
            ExtractionStatus::Failed(_) => None,
        };
        if let Some(records) = extracted {
            let fetched_at = request.window.until.unwrap_or(started_at);
            self.store
                .save_checkpoint(&Checkpoint::for_request(&request, fetched_at, records))
                .await?;
        }

        Ok(status)
    }

    /// Drops the event channel and waits for the logger to drain it.
    pub async fn shutdown(self) -> usize {
        let Self {
            orchestrator,
            event_logger,
            ..
        } = self;
        drop(orchestrator);
        event_logger.await.unwrap_or_default()
    }
}

async fn log_events(mut events: mpsc::Receiver<DownstreamEvent>) -> usize {
    let mut seen = 0;
    while let Some(event) = events.recv().await {
        seen += 1;
        info!(
            id = %event.id,
            kind = %event.kind,
            source = %event.source,
            owner = %event.owner,
            repo = ?event.repo,
            parent = %event.parent_entity,
            references = event.references.len(),
            "Downstream event"
        );
    }
    seen
}
