use super::{into_records, Dialect, Listing, RateLimitHeaders, ResetFormat};
use crate::model::{Cursor, ExtractionRequest, TimeWindow};
use reqwest::header::HeaderMap;
use serde_json::Value;

/// Keys under which Jira list endpoints return their records.
const RECORD_KEYS: [&str; 4] = ["issues", "values", "comments", "worklogs"];

const JQL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

pub struct Jira;

impl Dialect for Jira {
    fn initial_cursor(&self) -> Cursor {
        Cursor::Offset(0)
    }

    fn query(&self, request: &ExtractionRequest, cursor: Cursor) -> Vec<(String, String)> {
        let mut caller_jql = None;
        let mut query: Vec<(String, String)> = request
            .params
            .iter()
            .filter(|(k, v)| {
                if k == "jql" {
                    caller_jql = Some(v.clone());
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect();

        if let Some(jql) = windowed_jql(caller_jql.as_deref(), &request.window) {
            query.push(("jql".to_string(), jql));
        }

        let start_at = match cursor {
            Cursor::Offset(n) => n,
            Cursor::Page(n) => n.saturating_sub(1) * request.page_size,
        };
        query.push(("startAt".to_string(), start_at.to_string()));
        query.push(("maxResults".to_string(), request.page_size.to_string()));

        query
    }

    fn accept(&self) -> &'static str {
        "application/json"
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            remaining: "x-ratelimit-remaining",
            reset: "x-ratelimit-reset",
            reset_format: ResetFormat::Rfc3339,
        }
    }

    fn listing(&self, body: Value, _headers: &HeaderMap, cursor: Cursor) -> Result<Listing, String> {
        let Value::Object(mut map) = body else {
            return Err("expected a JSON object".into());
        };

        let items = RECORD_KEYS
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| format!("no record array under any of {RECORD_KEYS:?}"))?;

        let is_last = match map.get("isLast").and_then(Value::as_bool) {
            Some(flag) => Some(flag),
            None => map.get("total").and_then(Value::as_u64).map(|total| {
                let start_at = map
                    .get("startAt")
                    .and_then(Value::as_u64)
                    .unwrap_or(match cursor {
                        Cursor::Offset(n) => n as u64,
                        Cursor::Page(_) => 0,
                    });
                start_at + items.len() as u64 >= total
            }),
        };

        Ok(Listing {
            records: into_records(items)?,
            is_last,
        })
    }
}

/// Combines caller JQL with an `updated` window, keeping any ORDER BY at
/// the end where JQL requires it.
fn windowed_jql(caller: Option<&str>, window: &TimeWindow) -> Option<String> {
    let mut clauses = Vec::new();
    let mut order_by = None;

    if let Some(jql) = caller.map(str::trim).filter(|j| !j.is_empty()) {
        let (filter, order) = match jql.to_ascii_uppercase().find("ORDER BY") {
            Some(idx) => (jql[..idx].trim(), Some(jql[idx..].trim())),
            None => (jql, None),
        };
        order_by = order;
        if !filter.is_empty() {
            clauses.push(format!("({filter})"));
        }
    }

    if let Some(since) = window.since {
        clauses.push(format!("updated >= \"{}\"", since.format(JQL_TIME_FORMAT)));
    }
    if let Some(until) = window.until {
        clauses.push(format!("updated <= \"{}\"", until.format(JQL_TIME_FORMAT)));
    }

    let filter = clauses.join(" AND ");
    match (filter.is_empty(), order_by) {
        (true, None) => None,
        (true, Some(order)) => Some(order.to_string()),
        (false, None) => Some(filter),
        (false, Some(order)) => Some(format!("{filter} {order}")),
    }
}
