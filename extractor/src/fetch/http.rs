use super::rate_limit::RateLimitStatus;
use super::PageFetcher;
use crate::model::{Cursor, ExtractionRequest, FetchOutcome, Page, SourceKind};
use crate::source::{dialect, Dialect};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use extractor_core::config::HttpConfig;
use extractor_core::{Config, Error, Result};
use metrics::{counter, histogram};
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Bodies attached to errors are cut to this many characters.
const MAX_BODY_SNIPPET: usize = 2048;

#[derive(Clone)]
pub enum Credentials {
    None,
    Bearer(String),
    Basic {
        username: String,
        password: Option<String>,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::None => write!(f, "None"),
            Credentials::Bearer(_) => write!(f, "Bearer(***)"),
            Credentials::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
        }
    }
}

#[derive(Debug, Clone)]
struct SourceEndpoint {
    base_url: String,
    credentials: Credentials,
}

/// Issues one GET per page and classifies the response. Holds no state
/// between calls beyond the shared connection pool.
pub struct HttpPageFetcher {
    client: reqwest::Client,
    endpoints: HashMap<SourceKind, SourceEndpoint>,
}

impl HttpPageFetcher {
    pub fn new(http: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(http.timeout_secs))
            .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
            .user_agent(http.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            endpoints: HashMap::new(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let github_credentials = match &config.github.token {
            Some(token) => Credentials::Bearer(token.clone()),
            None => Credentials::None,
        };
        let jira_credentials = match &config.jira.username {
            Some(username) => Credentials::Basic {
                username: username.clone(),
                password: config.jira.api_token.clone(),
            },
            None => Credentials::None,
        };

        Ok(Self::new(&config.http)?
            .with_source(SourceKind::Github, &config.github.base_url, github_credentials)
            .with_source(SourceKind::Jira, &config.jira.base_url, jira_credentials))
    }

    pub fn with_source(
        mut self,
        source: SourceKind,
        base_url: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        self.endpoints.insert(source, SourceEndpoint { base_url, credentials });
        self
    }

    /// One GET against `url` with `query`, classified for `source`.
    pub async fn get(
        &self,
        source: SourceKind,
        url: &str,
        query: &[(String, String)],
        cursor: Cursor,
        page_size: u32,
    ) -> Result<FetchOutcome> {
        let endpoint = self.endpoint(source)?;
        let dialect = dialect(source);

        let mut builder = self
            .client
            .get(url)
            .query(query)
            .header(ACCEPT, dialect.accept());
        if source == SourceKind::Github {
            builder = builder.header("X-GitHub-Api-Version", "2022-11-28");
        }
        builder = match &endpoint.credentials {
            Credentials::None => builder,
            Credentials::Bearer(token) => builder.bearer_auth(token),
            Credentials::Basic { username, password } => builder.basic_auth(username, password.as_ref()),
        };

        let start = Instant::now();
        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        histogram!("extractor_fetch_duration_ms", "source" => source.to_string())
            .record(start.elapsed().as_millis() as f64);

        let outcome = classify(dialect, status, &headers, &body, cursor, page_size, Utc::now())?;

        match &outcome {
            FetchOutcome::Page(page) => {
                counter!("extractor_pages_fetched", "source" => source.to_string()).increment(1);
                debug!(
                    url,
                    %cursor,
                    records = page.records.len(),
                    is_last = page.is_last,
                    "Fetched page"
                );
            }
            FetchOutcome::EmptyTerminal => {
                debug!(url, %cursor, status = status.as_u16(), "Empty terminal response");
            }
            FetchOutcome::RateLimited { reset_at } => {
                counter!("extractor_rate_limited", "source" => source.to_string()).increment(1);
                warn!(url, %cursor, reset_at = %reset_at, "Rate limited");
            }
            FetchOutcome::Fatal { status, .. } => {
                warn!(url, %cursor, status, "Unexpected HTTP status");
            }
        }

        Ok(outcome)
    }

    fn endpoint(&self, source: SourceKind) -> Result<&SourceEndpoint> {
        self.endpoints
            .get(&source)
            .ok_or_else(|| Error::Config(format!("no endpoint configured for source {source}")))
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    #[instrument(skip(self, request), fields(source = %request.source, scope = %request.scope(), entity = %request.entity))]
    async fn fetch_page(&self, request: &ExtractionRequest, cursor: Cursor) -> Result<FetchOutcome> {
        let endpoint = self.endpoint(request.source)?;
        let url = format!("{}{}", endpoint.base_url, request.render_path()?);
        let query = dialect(request.source).query(request, cursor);

        self.get(request.source, &url, &query, cursor, request.page_size)
            .await
    }
}

/// Maps one HTTP response onto a [`FetchOutcome`].
///
/// 404, 422 and 304 end pagination quietly, as does a 200 with no records.
/// 403 and 429 are rate limits only when the remaining-quota header says
/// the quota is spent; otherwise they are unexpected statuses like any other
/// non-200. A page is last when the API says so, or, when it says nothing,
/// when it holds fewer records than were asked for.
pub fn classify(
    dialect: &dyn Dialect,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    cursor: Cursor,
    page_size: u32,
    now: DateTime<Utc>,
) -> Result<FetchOutcome> {
    match status {
        StatusCode::OK => {}
        StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::NOT_MODIFIED => {
            return Ok(FetchOutcome::EmptyTerminal);
        }
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            let quota = RateLimitStatus::from_headers(headers, dialect.rate_limit_headers(), now);
            if quota.is_exhausted() {
                return Ok(FetchOutcome::RateLimited {
                    reset_at: quota.reset_at_or_default(now),
                });
            }
            return Ok(FetchOutcome::Fatal {
                status: status.as_u16(),
                body: snippet(body),
            });
        }
        other => {
            return Ok(FetchOutcome::Fatal {
                status: other.as_u16(),
                body: snippet(body),
            });
        }
    }

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| Error::MalformedResponse {
            details: format!("invalid JSON: {e}"),
            body: snippet(body),
        })?;

    let listing = dialect
        .listing(value, headers, cursor)
        .map_err(|details| Error::MalformedResponse {
            details,
            body: snippet(body),
        })?;

    if listing.records.is_empty() {
        return Ok(FetchOutcome::EmptyTerminal);
    }

    let inferred_last = listing.records.len() < page_size as usize;
    Ok(FetchOutcome::Page(Page {
        cursor,
        is_last: listing.is_last.unwrap_or(inferred_last),
        records: listing.records,
    }))
}

fn snippet(body: &str) -> String {
    match body.char_indices().nth(MAX_BODY_SNIPPET) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Github, Jira};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use reqwest::header::{HeaderValue, LINK};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn github(status: u16, headers: &HeaderMap, body: &str, page_size: u32) -> Result<FetchOutcome> {
        classify(
            &Github,
            StatusCode::from_u16(status).unwrap(),
            headers,
            body,
            Cursor::Page(1),
            page_size,
            now(),
        )
    }

    #[test]
    fn terminal_statuses_end_quietly() {
        for status in [404, 422, 304] {
            let outcome = github(status, &HeaderMap::new(), "", 2).unwrap();
            assert_eq!(outcome, FetchOutcome::EmptyTerminal, "status {status}");
        }
        let outcome = github(200, &HeaderMap::new(), "[]", 2).unwrap();
        assert_eq!(outcome, FetchOutcome::EmptyTerminal);
    }

    #[test]
    fn exhausted_quota_is_rate_limited() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1714564860"));

        for status in [403, 429] {
            let outcome = github(status, &headers, "API rate limit exceeded", 2).unwrap();
            assert_eq!(
                outcome,
                FetchOutcome::RateLimited {
                    reset_at: now() + chrono::Duration::seconds(60)
                }
            );
        }
    }

    #[test]
    fn forbidden_with_quota_left_is_fatal() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4999"));

        let outcome = github(403, &headers, "Resource not accessible", 2).unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Fatal {
                status: 403,
                body: "Resource not accessible".to_string()
            }
        );
    }

    #[test]
    fn other_statuses_are_fatal() {
        let outcome = github(502, &HeaderMap::new(), "bad gateway", 2).unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Fatal {
                status: 502,
                body: "bad gateway".to_string()
            }
        );
    }

    #[test]
    fn short_page_is_last() {
        let outcome = github(200, &HeaderMap::new(), r#"[{"id":1}]"#, 2).unwrap();
        let FetchOutcome::Page(page) = outcome else {
            panic!("expected a page");
        };
        assert!(page.is_last);
        assert_eq!(page.records.len(), 1);

        let outcome = github(200, &HeaderMap::new(), r#"[{"id":1},{"id":2}]"#, 2).unwrap();
        let FetchOutcome::Page(page) = outcome else {
            panic!("expected a page");
        };
        assert!(!page.is_last);
    }

    #[test]
    fn explicit_flag_beats_size_inference() {
        let mut headers = HeaderMap::new();
        headers.insert(LINK, HeaderValue::from_static(r#"<https://x?page=2>; rel="prev""#));

        let outcome = github(200, &headers, r#"[{"id":1},{"id":2}]"#, 2).unwrap();
        let FetchOutcome::Page(page) = outcome else {
            panic!("expected a page");
        };
        assert!(page.is_last);

        let outcome = classify(
            &Jira,
            StatusCode::OK,
            &HeaderMap::new(),
            r#"{"isLast": false, "values": [{"id": "1"}]}"#,
            Cursor::Offset(0),
            50,
            now(),
        )
        .unwrap();
        let FetchOutcome::Page(page) = outcome else {
            panic!("expected a page");
        };
        assert!(!page.is_last);
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = github(200, &HeaderMap::new(), "<html>oops</html>", 2).unwrap_err();
        match err {
            Error::MalformedResponse { body, .. } => assert_eq!(body, "<html>oops</html>"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(MAX_BODY_SNIPPET + 10);
        let outcome = github(500, &HeaderMap::new(), &body, 2).unwrap();
        let FetchOutcome::Fatal { body, .. } = outcome else {
            panic!("expected fatal");
        };
        assert_eq!(body.len(), MAX_BODY_SNIPPET + 3);
    }

    #[test]
    fn unknown_source_is_a_config_error() {
        let fetcher = HttpPageFetcher::new(&Config::default().http).unwrap();
        let err = fetcher.endpoint(SourceKind::Jira).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
