use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("rate limit exceeded, quota resets at {reset_at}")]
    RateLimitExceeded { reset_at: DateTime<Utc> },

    #[error("unexpected HTTP status {status}: {body}")]
    UnknownHttpStatus { status: u16, body: String },

    #[error("sink write failed: {0}")]
    SinkWrite(String),

    #[error("malformed response ({details}): {body}")]
    MalformedResponse { details: String, body: String },

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("endpoint template error: {0}")]
    Template(String),

    #[error("extraction cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient failures worth retrying within the same job.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Database(sqlx::Error::Database(db)) => !db.is_unique_violation(),
            Error::Database(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Template(_))
    }

    /// When a scheduler may try the whole job again.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Error::RateLimitExceeded { reset_at } => Some(*reset_at),
            _ => None,
        }
    }

    /// Short stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Error::UnknownHttpStatus { .. } => "unknown_http_status",
            Error::SinkWrite(_) => "sink_write",
            Error::MalformedResponse { .. } => "malformed_response",
            Error::Broadcast(_) => "broadcast",
            Error::Template(_) => "template",
            Error::Cancelled => "cancelled",
            Error::Database(_) => "database",
            Error::Http(_) => "http",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rate_limit_error_exposes_reset_time() {
        let reset_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let err = Error::RateLimitExceeded { reset_at };

        assert_eq!(err.retry_at(), Some(reset_at));
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "rate_limit_exceeded");
    }

    #[test]
    fn http_status_errors_are_not_retried() {
        let err = Error::UnknownHttpStatus {
            status: 500,
            body: "boom".to_string(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.retry_at(), None);
        assert_eq!(err.to_string(), "unexpected HTTP status 500: boom");
    }

    #[test]
    fn io_errors_are_retryable() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }
}
