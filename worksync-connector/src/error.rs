//! Error types for worksync-connector.

use std::time::Duration;

use thiserror::Error;

/// Failures a connector call can report.
///
/// Transient variants are retried by [`RetryPolicy`](crate::retry::RetryPolicy);
/// everything else surfaces immediately.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectorError {
    /// 5xx, 429 or a dropped connection. `retry_after` carries the server's
    /// `Retry-After` hint when present.
    #[error("transient remote failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("remote call timed out: {message}")]
    Timeout { message: String },

    /// Permanent 4xx or a payload the connector cannot express. Never retried.
    #[error("remote rejected the request: {message}")]
    Rejected { message: String },

    #[error("remote resource not found: {resource}")]
    NotFound { resource: String },

    /// 401/403: the bearer credential is no longer accepted.
    #[error("remote refused the credential: {message}")]
    Unauthorized { message: String },

    /// The remote answered with something the connector could not decode.
    #[error("unexpected remote payload: {message}")]
    InvalidPayload { message: String },

    #[error("connector configuration error: {message}")]
    Config { message: String },
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

impl ConnectorError {
    pub fn transient(message: impl Into<String>) -> Self {
        ConnectorError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        ConnectorError::Rejected {
            message: message.into(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        ConnectorError::InvalidPayload {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::Transient { .. } | ConnectorError::Timeout { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ConnectorError::NotFound { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ConnectorError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ConnectorError::Timeout {
                message: e.to_string(),
            }
        } else if e.is_decode() {
            ConnectorError::invalid_payload(e.to_string())
        } else if e.is_builder() {
            ConnectorError::Config {
                message: e.to_string(),
            }
        } else {
            ConnectorError::transient(e.to_string())
        }
    }
}
