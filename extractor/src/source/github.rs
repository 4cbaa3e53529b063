use super::{into_records, Dialect, Listing, RateLimitHeaders, ResetFormat};
use crate::model::{Cursor, ExtractionRequest};
use chrono::SecondsFormat;
use reqwest::header::{HeaderMap, LINK};
use serde_json::Value;

pub struct Github;

impl Dialect for Github {
    fn initial_cursor(&self) -> Cursor {
        Cursor::Page(1)
    }

    fn query(&self, request: &ExtractionRequest, cursor: Cursor) -> Vec<(String, String)> {
        let mut query = request.params.clone();

        if let Some(since) = request.window.since {
            query.push((
                "since".to_string(),
                since.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        if let Some(until) = request.window.until {
            query.push((
                "until".to_string(),
                until.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }

        let page = match cursor {
            Cursor::Page(n) => n,
            // GitHub only pages by number; translate an offset just in case.
            Cursor::Offset(offset) => offset / request.page_size + 1,
        };
        query.push(("per_page".to_string(), request.page_size.to_string()));
        query.push(("page".to_string(), page.to_string()));

        query
    }

    fn accept(&self) -> &'static str {
        "application/vnd.github+json"
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            remaining: "x-ratelimit-remaining",
            reset: "x-ratelimit-reset",
            reset_format: ResetFormat::EpochSeconds,
        }
    }

    fn listing(&self, body: Value, headers: &HeaderMap, _cursor: Cursor) -> Result<Listing, String> {
        let items = match body {
            Value::Array(items) => items,
            // Search endpoints wrap results: {"total_count": n, "items": [...]}
            Value::Object(mut map) => match map.remove("items") {
                Some(Value::Array(items)) => items,
                _ => return Err("expected a JSON array or an object with an 'items' array".into()),
            },
            _ => return Err("expected a JSON array".into()),
        };

        Ok(Listing {
            records: into_records(items)?,
            is_last: last_page_from_link(headers),
        })
    }
}

/// A `Link` header without `rel="next"` marks the last page. No header, no
/// opinion.
fn last_page_from_link(headers: &HeaderMap) -> Option<bool> {
    let link = headers.get(LINK)?.to_str().ok()?;
    let has_next = link
        .split(',')
        .any(|part| part.split(';').skip(1).any(|p| p.trim() == r#"rel="next""#));
    Some(!has_next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;
    use pretty_assertions::assert_eq;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    fn request() -> ExtractionRequest {
        ExtractionRequest::builder(SourceKind::Github, "octo", "pulls", "/repos/{owner}/{repo}/pulls")
            .repo("hello")
            .param("state", "all")
            .since("2024-03-01T00:00:00Z".parse().unwrap())
            .page_size(50)
            .build()
            .unwrap()
    }

    #[test]
    fn builds_page_number_query() {
        let query = Github.query(&request(), Cursor::Page(3));
        assert_eq!(
            query,
            vec![
                ("state".to_string(), "all".to_string()),
                ("since".to_string(), "2024-03-01T00:00:00Z".to_string()),
                ("per_page".to_string(), "50".to_string()),
                ("page".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn link_header_without_next_marks_last_page() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                r#"<https://api.github.com/x?page=1>; rel="prev", <https://api.github.com/x?page=1>; rel="first""#,
            ),
        );
        let listing = Github
            .listing(json!([{"id": 1}]), &headers, Cursor::Page(2))
            .unwrap();
        assert_eq!(listing.is_last, Some(true));

        headers.insert(
            LINK,
            HeaderValue::from_static(r#"<https://api.github.com/x?page=3>; rel="next""#),
        );
        let listing = Github
            .listing(json!([{"id": 1}]), &headers, Cursor::Page(2))
            .unwrap();
        assert_eq!(listing.is_last, Some(false));
    }

    #[test]
    fn reads_search_items() {
        let listing = Github
            .listing(
                json!({"total_count": 2, "items": [{"id": 1}, {"id": 2}]}),
                &HeaderMap::new(),
                Cursor::Page(1),
            )
            .unwrap();
        assert_eq!(listing.records.len(), 2);
        assert_eq!(listing.is_last, None);
    }

    #[test]
    fn rejects_non_object_elements() {
        let err = Github
            .listing(json!([1, 2]), &HeaderMap::new(), Cursor::Page(1))
            .unwrap_err();
        assert!(err.contains("not an object"));
    }
}
