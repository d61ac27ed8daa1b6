use std::any::Any;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Application-wide error types for Tidings.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed before a status was received.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The server kept answering 429 after every backoff retry.
    #[error("Throttled by {url}{}", fmt_retry_after(.retry_after))]
    Throttled {
        url: String,
        retry_after: Option<Duration>,
    },

    /// The server kept answering 503 after every backoff retry.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The circuit breaker rejected the call without attempting it.
    #[error("Circuit open for source '{source_id}'{}", fmt_last_error(.last_error))]
    CircuitOpen {
        source_id: String,
        last_error: Option<String>,
    },

    /// The domain's access policy forbids the URL.
    #[error("Disallowed by access policy: {url} ({reason})")]
    PolicyDenied { url: String, reason: String },

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Feed or listing page could not be parsed.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A source implementation failed in an unexpected way.
    #[error("Source '{source_id}' failed: {message}")]
    SourceError { source_id: String, message: String },

    /// HTML-to-Markdown conversion failed.
    #[error("Cleaner error: {0}")]
    CleanerError(String),

    /// Writing an article failed.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled before this unit of work started.
    #[error("Cancelled before start")]
    Cancelled,
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}s)", d.as_secs()))
        .unwrap_or_default()
}

fn fmt_last_error(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(", last error: {e}"))
        .unwrap_or_default()
}

/// Coarse classification of an error, used in skip records and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Network,
    Timeout,
    Throttled,
    ServiceUnavailable,
    CircuitOpen,
    PolicyDenied,
    SourceLogic,
    Content,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Throttled => "throttled",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::PolicyDenied => "policy_denied",
            ErrorKind::SourceLogic => "source_logic",
            ErrorKind::Content => "content",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::HttpError(_) | AppError::HttpStatus { .. } | AppError::NetworkError(_) => {
                ErrorKind::Network
            }
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::Throttled { .. } => ErrorKind::Throttled,
            AppError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            AppError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            AppError::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            AppError::ConfigError(_) => ErrorKind::Configuration,
            AppError::SourceError { .. } => ErrorKind::SourceLogic,
            AppError::ParseError(_)
            | AppError::CleanerError(_)
            | AppError::StorageError(_)
            | AppError::SerializationError(_)
            | AppError::Io(_) => ErrorKind::Content,
            AppError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    ///
    /// Only timeouts and connection failures qualify. Throttling and 503s
    /// have already been retried with backoff by the time they surface here.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should count against the circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::HttpError(_)
            | AppError::Throttled { .. }
            | AppError::ServiceUnavailable(_)
            | AppError::SourceError { .. }
            | AppError::ParseError(_) => true,
            AppError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
