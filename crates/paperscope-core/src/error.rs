//! Error taxonomy for the ingestion pipeline.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using paperscope's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for paperscope operations.
///
/// The first six variants are the pipeline taxonomy: stage workers classify
/// failures with [`Error::is_retryable`] and degrade the candidate, while
/// configuration and discovery-wide errors fail the whole job.
#[derive(Error, Debug)]
pub enum Error {
    /// Network timeout, connection reset, 5xx, or another condition expected to clear.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Upstream asked us to slow down, optionally with a retry hint.
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Non-retryable input failure (404/403, malformed candidate, checksum mismatch).
    #[error("Permanent input error: {0}")]
    PermanentInput(String),

    /// Enrichment provider cannot serve the request; callers should fall back.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Transactional merge lost a race or violated a constraint.
    #[error("Graph conflict: {0}")]
    GraphConflict(String),

    /// Configuration error, fatal at job start
    #[error("Configuration error: {0}")]
    Config(String),

    /// A retried operation gave up.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// A job for the same source is already running and the overlap policy rejects queuing.
    #[error("Already running: {0}")]
    AlreadyRunning(String),

    /// Work was cancelled before it started or while awaiting I/O.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a stage should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TransientIo(_) | Error::RateLimited { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            Error::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Provider-supplied retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short machine-readable class name, used in job outcome summaries.
    pub fn class(&self) -> &'static str {
        match self {
            Error::TransientIo(_) | Error::Io(_) => "transient_io",
            Error::RateLimited { .. } => "rate_limited",
            Error::PermanentInput(_) | Error::Serialization(_) => "permanent_input",
            Error::ProviderUnavailable(_) => "provider_unavailable",
            Error::GraphConflict(_) => "graph_conflict",
            Error::Config(_) => "configuration",
            Error::RetriesExhausted { .. } => "retries_exhausted",
            Error::AlreadyRunning(_) => "already_running",
            Error::Cancelled(_) => "cancelled",
            Error::NotFound(_) => "not_found",
            Error::Database(_) => "database",
            Error::Internal(_) => "internal",
        }
    }

    /// Classify an HTTP status returned by an upstream server.
    pub fn from_status(status: u16, context: impl Into<String>) -> Self {
        let context = context.into();
        match status {
            429 => Error::RateLimited {
                message: format!("{context}: HTTP 429"),
                retry_after: None,
            },
            408 | 500..=599 => Error::TransientIo(format!("{context}: HTTP {status}")),
            _ => Error::PermanentInput(format!("{context}: HTTP {status}")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Error::from_status(status.as_u16(), e.to_string());
        }
        if e.is_decode() {
            return Error::PermanentInput(e.to_string());
        }
        if e.is_builder() {
            return Error::Config(e.to_string());
        }
        Error::TransientIo(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_transient() {
        let err = Error::TransientIo("connection reset".to_string());
        assert_eq!(err.to_string(), "Transient I/O error: connection reset");
    }

    #[test]
    fn test_error_display_retries_exhausted() {
        let err = Error::RetriesExhausted {
            attempts: 3,
            last_error: "HTTP 503".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Retries exhausted after 3 attempts: HTTP 503"
        );
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("missing API key".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing API key");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::TransientIo("x".into()).is_retryable());
        assert!(Error::RateLimited {
            message: "x".into(),
            retry_after: None
        }
        .is_retryable());
        assert!(!Error::PermanentInput("x".into()).is_retryable());
        assert!(!Error::ProviderUnavailable("x".into()).is_retryable());
        assert!(!Error::GraphConflict("x".into()).is_retryable());
        assert!(!Error::Config("x".into()).is_retryable());
    }

    #[test]
    fn test_io_timeout_is_retryable() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_retryable());
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            Error::from_status(404, "GET /x"),
            Error::PermanentInput(_)
        ));
        assert!(matches!(
            Error::from_status(403, "GET /x"),
            Error::PermanentInput(_)
        ));
        assert!(matches!(
            Error::from_status(503, "GET /x"),
            Error::TransientIo(_)
        ));
        assert!(matches!(
            Error::from_status(429, "GET /x"),
            Error::RateLimited { .. }
        ));
    }

    #[test]
    fn test_retry_after_hint() {
        let err = Error::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(Error::TransientIo("x".into()).retry_after(), None);
    }

    #[test]
    fn test_class_names() {
        assert_eq!(Error::GraphConflict("x".into()).class(), "graph_conflict");
        assert_eq!(
            Error::ProviderUnavailable("x".into()).class(),
            "provider_unavailable"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
