use chrono::{DateTime, Utc};
use extractor_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// An opaque record as returned by a source API.
pub type Record = serde_json::Map<String, Value>;

/// GitHub caps `per_page` at 100.
pub const GITHUB_MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Github,
    Jira,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Github => write!(f, "github"),
            SourceKind::Jira => write!(f, "jira"),
        }
    }
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(SourceKind::Github),
            "jira" => Ok(SourceKind::Jira),
            other => Err(Error::Config(format!("unknown source kind: {other}"))),
        }
    }
}

/// Incremental window. Either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Which record field feeds downstream events, and what those events are called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSpec {
    /// Dotted path into the record, e.g. `number` or `issue.id`.
    pub field: String,
    /// Event kind published downstream, e.g. `pull_commits`.
    pub event_kind: String,
}

/// One extraction job. Built once through [`ExtractionRequestBuilder`] and
/// only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub source: SourceKind,
    pub owner: String,
    pub repo: Option<String>,
    /// Logical entity name, e.g. `pulls`, `issue_comments`.
    pub entity: String,
    /// Path template relative to the source base URL, e.g.
    /// `/repos/{owner}/{repo}/pulls/{pull_number}/commits`.
    pub endpoint: String,
    pub window: TimeWindow,
    pub page_size: u32,
    /// Extra query parameters sent on every page (`state=all`, `jql=...`).
    pub params: Vec<(String, String)>,
    /// Values for template placeholders beyond `owner` and `repo`.
    pub context: BTreeMap<String, String>,
    /// Field identifying a record for duplicate detection.
    pub key_field: String,
    pub reference: Option<ReferenceSpec>,
}

impl ExtractionRequest {
    pub fn builder(
        source: SourceKind,
        owner: impl Into<String>,
        entity: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> ExtractionRequestBuilder {
        ExtractionRequestBuilder {
            request: ExtractionRequest {
                source,
                owner: owner.into(),
                repo: None,
                entity: entity.into(),
                endpoint: endpoint.into(),
                window: TimeWindow::default(),
                page_size: 100,
                params: Vec::new(),
                context: BTreeMap::new(),
                key_field: "id".to_string(),
                reference: None,
            },
        }
    }

    /// Fills the endpoint template from owner, repo and the context map.
    pub fn render_path(&self) -> Result<String> {
        let mut rendered = String::with_capacity(self.endpoint.len());
        let mut rest = self.endpoint.as_str();

        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                Error::Template(format!("unclosed placeholder in '{}'", self.endpoint))
            })?;
            let name = &after[..close];
            let value = match name {
                "owner" => Some(self.owner.as_str()),
                "repo" => self.repo.as_deref(),
                _ => self.context.get(name).map(String::as_str),
            }
            .ok_or_else(|| {
                Error::Template(format!(
                    "no value for placeholder '{{{}}}' in '{}'",
                    name, self.endpoint
                ))
            })?;
            rendered.push_str(value);
            rest = &after[close + 1..];
        }
        rendered.push_str(rest);

        Ok(rendered)
    }

    /// `owner/repo`, or just `owner` for sources without repositories.
    pub fn scope(&self) -> String {
        match &self.repo {
            Some(repo) => format!("{}/{}", self.owner, repo),
            None => self.owner.clone(),
        }
    }
}

pub struct ExtractionRequestBuilder {
    request: ExtractionRequest,
}

impl ExtractionRequestBuilder {
    pub fn repo(mut self, repo: impl Into<String>) -> Self {
        self.request.repo = Some(repo.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.request.window.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.request.window.until = Some(until);
        self
    }

    pub fn window(mut self, window: TimeWindow) -> Self {
        self.request.window = window;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.request.page_size = page_size;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.params.push((key.into(), value.into()));
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.context.insert(key.into(), value.into());
        self
    }

    pub fn key_field(mut self, field: impl Into<String>) -> Self {
        self.request.key_field = field.into();
        self
    }

    pub fn reference(mut self, field: impl Into<String>, event_kind: impl Into<String>) -> Self {
        self.request.reference = Some(ReferenceSpec {
            field: field.into(),
            event_kind: event_kind.into(),
        });
        self
    }

    pub fn build(self) -> Result<ExtractionRequest> {
        let request = self.request;

        if request.owner.trim().is_empty() {
            return Err(Error::Config("owner must not be empty".into()));
        }
        if request.page_size == 0 {
            return Err(Error::Config("page_size must be greater than 0".into()));
        }
        if request.source == SourceKind::Github && request.page_size > GITHUB_MAX_PAGE_SIZE {
            return Err(Error::Config(format!(
                "page_size {} exceeds the GitHub maximum of {}",
                request.page_size, GITHUB_MAX_PAGE_SIZE
            )));
        }
        if let (Some(since), Some(until)) = (request.window.since, request.window.until) {
            if until < since {
                return Err(Error::Config(format!(
                    "window ends ({until}) before it starts ({since})"
                )));
            }
        }

        request.render_path()?;
        Ok(request)
    }
}

/// Position of a page within a paginated listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cursor {
    /// 1-based page number (`page=`).
    Page(u32),
    /// 0-based record offset (`startAt=`).
    Offset(u32),
}

impl Cursor {
    /// Cursor of the page after one that returned `returned` records.
    /// Offsets move by what actually arrived, since servers may cap the
    /// page size below what was asked for.
    pub fn advance(self, returned: usize) -> Self {
        match self {
            Cursor::Page(n) => Cursor::Page(n + 1),
            Cursor::Offset(n) => Cursor::Offset(n.saturating_add(returned as u32)),
        }
    }

    pub fn is_first(self) -> bool {
        matches!(self, Cursor::Page(1) | Cursor::Offset(0))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Page(n) => write!(f, "page {n}"),
            Cursor::Offset(n) => write!(f, "offset {n}"),
        }
    }
}

/// One successfully fetched, non-empty page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub cursor: Cursor,
    pub records: Vec<Record>,
    pub is_last: bool,
}

/// Classified result of a single page request.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Page(Page),
    /// Clean end of results: 404, 422, 304 or an empty listing.
    EmptyTerminal,
    RateLimited { reset_at: DateTime<Utc> },
    Fatal { status: u16, body: String },
}

/// Reads a string-ish value at a dotted path. Numbers are rendered in
/// decimal; objects, arrays and nulls yield `None`.
pub fn field_as_string(record: &Record, path: &str) -> Option<String> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }

    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
