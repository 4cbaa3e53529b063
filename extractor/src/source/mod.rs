//! Per-API conventions: how pages are addressed, how incremental windows are
//! expressed, where records live in a response and how the API signals the
//! last page and its rate limits.

pub mod github;
pub mod jira;

use crate::model::{Cursor, ExtractionRequest, Record, SourceKind};
use reqwest::header::HeaderMap;
use serde_json::Value;

pub use github::Github;
pub use jira::Jira;

/// How a source encodes its quota reset time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetFormat {
    /// Unix epoch seconds (`1714564800`).
    EpochSeconds,
    /// RFC 3339 timestamp (`2024-05-01T12:00:00Z`).
    Rfc3339,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitHeaders {
    pub remaining: &'static str,
    pub reset: &'static str,
    pub reset_format: ResetFormat,
}

/// Records found in a 200 response plus the API's own last-page signal,
/// when it gives one.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub records: Vec<Record>,
    pub is_last: Option<bool>,
}

pub trait Dialect: Send + Sync {
    fn initial_cursor(&self) -> Cursor;

    /// Full query string for one page, including the request's own params,
    /// its incremental window and the paging parameters.
    fn query(&self, request: &ExtractionRequest, cursor: Cursor) -> Vec<(String, String)>;

    fn accept(&self) -> &'static str;

    fn rate_limit_headers(&self) -> RateLimitHeaders;

    /// Pulls the record list out of a parsed body. The error string
    /// describes what was wrong with the shape.
    fn listing(&self, body: Value, headers: &HeaderMap, cursor: Cursor) -> Result<Listing, String>;
}

pub fn dialect(source: SourceKind) -> &'static dyn Dialect {
    match source {
        SourceKind::Github => &Github,
        SourceKind::Jira => &Jira,
    }
}

pub(crate) fn into_records(items: Vec<Value>) -> Result<Vec<Record>, String> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            other => Err(format!("element {i} is not an object: {other}")),
        })
        .collect()
}
