use crate::source::{RateLimitHeaders, ResetFormat};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use extractor_core::{Error, RateLimitPolicy, Result};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::warn;

/// Used when a source reports an exhausted quota but no usable reset time.
const DEFAULT_RESET_DELAY_SECS: i64 = 60;

/// Quota information read from one response. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub remaining: Option<i64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitStatus {
    pub fn from_headers(headers: &HeaderMap, names: RateLimitHeaders, now: DateTime<Utc>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };

        let remaining = header(names.remaining).and_then(|v| v.parse::<i64>().ok());

        let reset_at = header(names.reset)
            .and_then(|v| match names.reset_format {
                ResetFormat::EpochSeconds => v
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
                ResetFormat::Rfc3339 => DateTime::parse_from_rfc3339(v)
                    .ok()
                    .map(|ts| ts.with_timezone(&Utc)),
            })
            .or_else(|| {
                header(RETRY_AFTER.as_str())
                    .and_then(|v| v.parse::<i64>().ok())
                    .map(|secs| now + ChronoDuration::seconds(secs))
            });

        Self { remaining, reset_at }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_some_and(|r| r <= 0)
    }

    pub fn reset_at_or_default(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.reset_at
            .unwrap_or_else(|| now + ChronoDuration::seconds(DEFAULT_RESET_DELAY_SECS))
    }
}

/// Turns a rate-limited response into either an error for the caller or a
/// wait before the same page is requested again. Also paces outgoing
/// requests when a client-side rate is configured.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    pacer: Option<DefaultDirectRateLimiter>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self { policy, pacer: None }
    }

    pub fn with_pacing(mut self, requests_per_second: Option<u32>) -> Self {
        self.pacer = requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| DefaultDirectRateLimiter::direct(Quota::per_second(rps)));
        self
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub async fn until_ready(&self) {
        if let Some(pacer) = &self.pacer {
            pacer.until_ready().await;
        }
    }

    /// How long to sleep before refetching, given how long this page has
    /// already waited. Fails with `RateLimitExceeded` under the `Fail`
    /// policy or once the wait budget is spent.
    pub fn on_rate_limited(
        &self,
        reset_at: DateTime<Utc>,
        already_waited: Duration,
        now: DateTime<Utc>,
    ) -> Result<Duration> {
        match self.policy {
            RateLimitPolicy::Fail => Err(Error::RateLimitExceeded { reset_at }),
            RateLimitPolicy::Wait { max_wait_secs } => {
                let wait = (reset_at - now).to_std().unwrap_or(Duration::ZERO);
                if already_waited + wait > Duration::from_secs(max_wait_secs) {
                    warn!(
                        reset_at = %reset_at,
                        waited_secs = already_waited.as_secs(),
                        max_wait_secs,
                        "Rate limit wait budget exhausted"
                    );
                    return Err(Error::RateLimitExceeded { reset_at });
                }
                Ok(wait)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{dialect, Dialect};
    use crate::model::SourceKind;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use reqwest::header::HeaderValue;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn reads_github_epoch_reset() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1714564860"));

        let status = RateLimitStatus::from_headers(
            &headers,
            dialect(SourceKind::Github).rate_limit_headers(),
            now(),
        );
        assert!(status.is_exhausted());
        assert_eq!(status.reset_at, Some(now() + ChronoDuration::seconds(60)));
    }

    #[test]
    fn falls_back_to_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));

        let status = RateLimitStatus::from_headers(
            &headers,
            crate::source::Jira.rate_limit_headers(),
            now(),
        );
        assert_eq!(status.reset_at, Some(now() + ChronoDuration::seconds(30)));
    }

    #[test]
    fn missing_remaining_header_is_not_exhausted() {
        let status = RateLimitStatus::from_headers(
            &HeaderMap::new(),
            crate::source::Github.rate_limit_headers(),
            now(),
        );
        assert!(!status.is_exhausted());
        assert_eq!(
            status.reset_at_or_default(now()),
            now() + ChronoDuration::seconds(DEFAULT_RESET_DELAY_SECS)
        );
    }

    #[test]
    fn fail_policy_always_errors() {
        let limiter = RateLimiter::new(RateLimitPolicy::Fail);
        let reset_at = now() + ChronoDuration::seconds(10);
        let err = limiter
            .on_rate_limited(reset_at, Duration::ZERO, now())
            .unwrap_err();
        assert_eq!(err.retry_at(), Some(reset_at));
    }

    #[test]
    fn wait_policy_respects_budget() {
        let limiter = RateLimiter::new(RateLimitPolicy::Wait { max_wait_secs: 60 });

        let wait = limiter
            .on_rate_limited(now() + ChronoDuration::seconds(45), Duration::ZERO, now())
            .unwrap();
        assert_eq!(wait, Duration::from_secs(45));

        let err = limiter
            .on_rate_limited(
                now() + ChronoDuration::seconds(45),
                Duration::from_secs(30),
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { .. }));

        // A reset time already in the past means refetch right away.
        let wait = limiter
            .on_rate_limited(now() - ChronoDuration::seconds(5), Duration::ZERO, now())
            .unwrap();
        assert_eq!(wait, Duration::ZERO);
    }
}
