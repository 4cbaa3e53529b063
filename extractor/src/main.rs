use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use extractor_core::{telemetry, Config};
use source_extractor::app::App;
use source_extractor::{ExtractionRequest, ExtractionStatus, SourceKind};
use sqlx::postgres::PgPoolOptions;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[clap(name = "extractor")]
#[clap(about = "Paginated GitHub and Jira extractor", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,

    /// Extract one entity listing into the database
    Extract {
        /// Source API: github or jira
        #[clap(long)]
        source: SourceKind,

        /// Organisation, user or Jira project key
        #[clap(long)]
        owner: String,

        #[clap(long)]
        repo: Option<String>,

        /// Logical entity name, e.g. pulls or issues
        #[clap(long)]
        entity: String,

        /// Path template, e.g. /repos/{owner}/{repo}/pulls
        #[clap(long)]
        endpoint: String,

        /// Start of the incremental window (RFC3339); defaults to the last checkpoint
        #[clap(long)]
        since: Option<DateTime<Utc>>,

        /// End of the incremental window (RFC3339)
        #[clap(long)]
        until: Option<DateTime<Utc>>,

        /// Override the configured page size
        #[clap(long)]
        page_size: Option<u32>,

        /// Extra query parameter as key=value, repeatable
        #[clap(long = "param", value_parser = parse_key_value)]
        params: Vec<(String, String)>,

        /// Template placeholder value as key=value, repeatable
        #[clap(long = "context", value_parser = parse_key_value)]
        context: Vec<(String, String)>,

        /// Record field used for duplicate detection
        #[clap(long, default_value = "id")]
        key_field: String,

        /// Record field whose values become downstream references
        #[clap(long, requires = "event_kind")]
        reference_field: Option<String>,

        /// Kind of the downstream events carrying those references
        #[clap(long, requires = "reference_field")]
        event_kind: Option<String>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %e, "Fatal error");
            process::exit(1);
        }
    }
}

/// Returns whether the command succeeded.
async fn run() -> anyhow::Result<bool> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    telemetry::init(&config.telemetry)?;

    let cli = Cli::parse();

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(std::time::Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await?;

    let succeeded = match cli.command {
        Commands::Migrate => {
            info!("Running database migrations");
            sqlx::migrate!("../migrations").run(&pool).await?;
            info!("Migrations completed successfully");
            true
        }

        Commands::Extract {
            source,
            owner,
            repo,
            entity,
            endpoint,
            since,
            until,
            page_size,
            params,
            context,
            key_field,
            reference_field,
            event_kind,
        } => {
            let mut builder = ExtractionRequest::builder(source, owner, entity, endpoint)
                .page_size(page_size.unwrap_or(config.extract.page_size))
                .key_field(key_field);
            if let Some(repo) = repo {
                builder = builder.repo(repo);
            }
            if let Some(since) = since {
                builder = builder.since(since);
            }
            if let Some(until) = until {
                builder = builder.until(until);
            }
            for (key, value) in params {
                builder = builder.param(key, value);
            }
            for (key, value) in context {
                builder = builder.context(key, value);
            }
            if let (Some(field), Some(kind)) = (reference_field, event_kind) {
                builder = builder.reference(field, kind);
            }
            let request = builder.build()?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping after the current page");
                    on_signal.cancel();
                }
            });

            let app = App::new(config, pool, cancel).await?;
            let status = app.extract(request).await?;
            let events = app.shutdown().await;

            match status {
                ExtractionStatus::Completed(records) => {
                    info!(records, events, "Extraction finished");
                    true
                }
                ExtractionStatus::CompletedEmpty => {
                    info!("Nothing to extract");
                    true
                }
                ExtractionStatus::Failed(failure) => {
                    if let Some(retry_at) = failure.error.retry_at() {
                        info!(%retry_at, "Job can be rescheduled once the quota resets");
                    }
                    error!(events, "{failure}");
                    false
                }
            }
        }
    };

    telemetry::shutdown();
    Ok(succeeded)
}
