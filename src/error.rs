//! Error types for the ingestion control plane.

use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("IMAP protocol error: {0}")]
    Imap(#[from] async_imap::error::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("status store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("sink submission error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mail parse error: {0}")]
    Parse(#[from] mailparse::MailParseError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("host {host} at capacity: {message}")]
    Busy { host: String, message: String },

    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("timeout during {operation} after {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{feature} not supported by {provider}")]
    NotSupported { feature: String, provider: String },

    #[error("sink rejected batch: {message}")]
    SinkRejected { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("worker queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("{message}")]
    Other { message: String },
}

impl IngestError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn rate_limit(message: impl Into<String>, retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimit {
            message: message.into(),
            retry_after_seconds,
        }
    }

    pub fn busy(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Busy {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds,
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_supported(feature: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::NotSupported {
            feature: feature.into(),
            provider: provider.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Whether the Worker Fleet's retry logic should re-enqueue a task that
    /// failed with this error (spec §7).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Imap(_)
                | IngestError::Io(_)
                | IngestError::Http(_)
                | IngestError::Connection { .. }
                | IngestError::Timeout { .. }
                | IngestError::RateLimit { .. }
                | IngestError::Busy { .. }
                | IngestError::SinkRejected { .. }
        )
    }

    /// Whether this error implies the mailbox's credentials need
    /// operator attention rather than a mechanical retry.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, IngestError::Authentication { .. })
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            IngestError::RateLimit {
                retry_after_seconds,
                ..
            } => *retry_after_seconds,
            _ => None,
        }
    }

    /// Stable label used as the `error_category` metrics dimension.
    pub fn category(&self) -> &'static str {
        match self {
            IngestError::Imap(_) => "imap",
            IngestError::Tls(_) => "tls",
            IngestError::Io(_) => "io",
            IngestError::Database(_) => "database",
            IngestError::Http(_) => "http",
            IngestError::Parse(_) => "parse",
            IngestError::Json(_) => "json",
            IngestError::Authentication { .. } => "authentication",
            IngestError::RateLimit { .. } => "rate_limit",
            IngestError::Busy { .. } => "busy",
            IngestError::Connection { .. } => "connection",
            IngestError::Timeout { .. } => "timeout",
            IngestError::NotFound { .. } => "not_found",
            IngestError::Validation { .. } => "validation",
            IngestError::NotSupported { .. } => "not_supported",
            IngestError::SinkRejected { .. } => "sink_rejected",
            IngestError::Configuration { .. } => "configuration",
            IngestError::QueueFull { .. } => "queue_full",
            IngestError::Other { .. } => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_categories() {
        assert!(IngestError::connection("reset").is_retryable());
        assert!(IngestError::busy("gmail.com", "at capacity").is_retryable());
        assert!(!IngestError::authentication("bad password").is_retryable());
        assert!(!IngestError::validation("subject", "missing").is_retryable());
    }

    #[test]
    fn reauth_only_for_authentication() {
        assert!(IngestError::authentication("bad password").requires_reauth());
        assert!(!IngestError::connection("reset").requires_reauth());
    }

    #[test]
    fn category_labels() {
        assert_eq!(IngestError::busy("h", "m").category(), "busy");
        assert_eq!(IngestError::authentication("m").category(), "authentication");
    }
}
