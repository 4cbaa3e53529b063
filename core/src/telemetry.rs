use crate::config::{LogFormat, TelemetryConfig};
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// HTTP and database client internals are only interesting when they fail.
const QUIET_TARGETS: [&str; 4] = ["hyper=warn", "reqwest=warn", "sqlx=warn", "h2=warn"];

/// Page fetch latency buckets, in milliseconds.
const FETCH_BUCKETS_MS: [f64; 9] = [25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0];

/// Installs the global subscriber and, when enabled, the Prometheus
/// endpoint. `RUST_LOG` overrides the configured level.
pub fn init(config: &TelemetryConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&config.log_level)))?;

    tracing_subscriber::registry()
        .with(log_layer(&config.log_format))
        .with(filter)
        .init();

    if config.metrics_enabled {
        install_exporter(config.metrics_port)?;
    }

    Ok(())
}

fn default_directives(level: &str) -> String {
    std::iter::once(level)
        .chain(QUIET_TARGETS)
        .collect::<Vec<_>>()
        .join(",")
}

fn log_layer(format: &LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_target(false).boxed(),
    }
}

fn install_exporter(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", "extractor")
        .set_buckets_for_metric(
            Matcher::Full("extractor_fetch_duration_ms".to_string()),
            &FETCH_BUCKETS_MS,
        )?
        .install()?;

    describe_metrics();
    tracing::info!(%addr, "Serving Prometheus metrics on /metrics");
    Ok(())
}

fn describe_metrics() {
    describe_counter!("extractor_pages_fetched", "Pages returned by source APIs");
    describe_counter!("extractor_records_sunk", "Records written to the sink");
    describe_counter!("extractor_duplicate_records", "Records skipped as duplicates by the sink");
    describe_counter!("extractor_events_broadcast", "Downstream events published");
    describe_counter!("extractor_rate_limited", "Responses classified as rate limited");
    describe_counter!("extractor_jobs", "Finished extraction jobs by outcome");
    describe_counter!("extractor_checkpoints_saved", "Incremental checkpoints written");
    describe_histogram!(
        "extractor_fetch_duration_ms",
        Unit::Milliseconds,
        "Latency of a single page fetch"
    );
}

pub fn shutdown() {
    tracing::info!("Shutting down telemetry");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn configured_level_comes_first_then_quiet_clients() {
        assert_eq!(
            default_directives("source_extractor=debug"),
            "source_extractor=debug,hyper=warn,reqwest=warn,sqlx=warn,h2=warn"
        );
    }

    #[test]
    fn default_directives_parse() {
        assert!(EnvFilter::try_new(default_directives("info")).is_ok());
    }
}
