//! Scripted collaborators for driving jobs without a network or database.

use crate::fetch::PageFetcher;
use crate::model::{Cursor, ExtractionRequest, FetchOutcome, Page, Record, SourceKind};
use crate::sink::{BatchSink, MemorySink, SinkReceipt};
use async_trait::async_trait;
use extractor_core::{DuplicatePolicy, Error, Result};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub(crate) fn record(id: u64) -> Record {
    json!({ "id": id, "number": id, "title": format!("item {id}") })
        .as_object()
        .cloned()
        .unwrap()
}

pub(crate) fn github_request(page_size: u32) -> ExtractionRequest {
    ExtractionRequest::builder(SourceKind::Github, "octo", "pulls", "/repos/{owner}/{repo}/pulls")
        .repo("hello")
        .page_size(page_size)
        .reference("number", "pull_commits")
        .build()
        .unwrap()
}

pub(crate) fn jira_request(page_size: u32) -> ExtractionRequest {
    ExtractionRequest::builder(SourceKind::Jira, "PROJ", "issues", "/rest/api/2/search")
        .param("jql", "project = PROJ")
        .page_size(page_size)
        .reference("id", "issue_comments")
        .build()
        .unwrap()
}

/// Pages of the given sizes with consecutive ids, each marked last when it
/// is short. A zero size becomes an empty terminal response.
pub(crate) fn pages(page_size: u32, sizes: &[usize]) -> Vec<Result<FetchOutcome>> {
    pages_from(Cursor::Page(1), page_size, sizes)
}

/// Like [`pages`], with cursors starting at `start`.
pub(crate) fn pages_from(start: Cursor, page_size: u32, sizes: &[usize]) -> Vec<Result<FetchOutcome>> {
    let mut next_id = 1u64;
    let mut cursor = start;
    sizes
        .iter()
        .map(|&size| {
            if size == 0 {
                return Ok(FetchOutcome::EmptyTerminal);
            }
            let records = (next_id..next_id + size as u64).map(record).collect();
            next_id += size as u64;
            let page = Page {
                cursor,
                records,
                is_last: size < page_size as usize,
            };
            cursor = cursor.advance(size);
            Ok(FetchOutcome::Page(page))
        })
        .collect()
}

/// Replays canned outcomes in order and remembers every cursor asked for.
/// Once the script runs out every fetch is an empty terminal.
pub(crate) struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<FetchOutcome>>>,
    cursors: Mutex<Vec<Cursor>>,
}

impl ScriptedFetcher {
    pub(crate) fn new(script: Vec<Result<FetchOutcome>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            cursors: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn cursors(&self) -> Vec<Cursor> {
        self.cursors.lock().unwrap().clone()
    }

    pub(crate) fn fetches(&self) -> usize {
        self.cursors.lock().unwrap().len()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch_page(&self, _request: &ExtractionRequest, cursor: Cursor) -> Result<FetchOutcome> {
        self.cursors.lock().unwrap().push(cursor);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(FetchOutcome::EmptyTerminal))
    }
}

/// Memory sink that rejects the listed calls (0-based) with a sink error.
pub(crate) struct FlakySink {
    pub(crate) inner: MemorySink,
    fail_on: HashSet<usize>,
    calls: AtomicUsize,
}

impl FlakySink {
    pub(crate) fn failing_on(calls: &[usize]) -> Self {
        Self {
            inner: MemorySink::new(DuplicatePolicy::Skip),
            fail_on: calls.iter().copied().collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchSink for FlakySink {
    async fn sink(&self, request: &ExtractionRequest, records: &[Record]) -> Result<SinkReceipt> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.contains(&call) {
            return Err(Error::SinkWrite("disk full".to_string()));
        }
        self.inner.sink(request, records).await
    }
}
