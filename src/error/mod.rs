// SPDX-License-Identifier: MIT OR Apache-2.0

use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// No HTTP response was received.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server error {status}: {message}")]
    Server { status: StatusCode, message: String },

    #[error("Client error {status}: {message}")]
    Client { status: StatusCode, message: String },

    /// Raised by the circuit breaker without attempting the transport.
    #[error("Circuit breaker [{service}] is open, retry after {retry_after:?}")]
    CircuitOpen {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("No backend instance available for service '{0}'")]
    NoInstance(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Build the error for a non-success HTTP status.
    #[must_use]
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        if status.is_server_error() {
            Self::Server { status, message }
        } else {
            Self::Client { status, message }
        }
    }

    /// The HTTP status carried by this error, if a response was received.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Server { status, .. } | Self::Client { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Network failures, timeouts and 5xx responses are worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Network)
            || matches!(self.class(), ErrorClass::Status(code) if code.is_server_error())
    }

    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether the error says something about the instance that served it.
    ///
    /// 4xx responses and local rejections leave the instance's health alone.
    #[must_use]
    pub fn blames_instance(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Server { .. }
        )
    }
}

/// How the retrier sees an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport-level failure, no status code.
    Network,
    /// An HTTP response with a non-success status.
    Status(StatusCode),
    /// Rejected locally before reaching the transport.
    Rejected,
    /// Anything else (configuration, decoding, validation).
    Other,
}

/// Trait for extracting an [`ErrorClass`] from errors.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for ClientError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Network(_) | Self::Timeout(_) => ErrorClass::Network,
            Self::Server { status, .. } | Self::Client { status, .. } => {
                ErrorClass::Status(*status)
            }
            Self::CircuitOpen { .. } | Self::NoInstance(_) => ErrorClass::Rejected,
            Self::Config(_) | Self::Validation(_) | Self::Decode(_) => ErrorClass::Other,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(e: url::ParseError) -> Self {
        Self::Config(format!("Invalid URL: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_splits_4xx_and_5xx() {
        let e = ClientError::from_status(StatusCode::BAD_GATEWAY, "upstream");
        assert!(matches!(e, ClientError::Server { .. }));
        assert!(e.is_retryable());

        let e = ClientError::from_status(StatusCode::NOT_FOUND, "missing");
        assert!(matches!(e, ClientError::Client { .. }));
        assert!(!e.is_retryable());
        assert_eq!(e.status(), Some(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_network_errors_are_retryable() {
        assert!(ClientError::Network("reset".into()).is_retryable());
        assert!(ClientError::Timeout(Duration::from_secs(1)).is_retryable());
        assert_eq!(ClientError::Network("x".into()).status(), None);
    }

    #[test]
    fn test_circuit_open_is_distinct() {
        let e = ClientError::CircuitOpen {
            service: "ml".into(),
            retry_after: Some(Duration::from_secs(5)),
        };
        assert!(e.is_circuit_open());
        assert!(!e.is_retryable());
        assert!(!e.blames_instance());
        assert_eq!(e.class(), ErrorClass::Rejected);
    }

    #[test]
    fn test_validation_is_terminal() {
        let e = ClientError::Validation("bad".into());
        assert_eq!(e.class(), ErrorClass::Other);
        assert!(!e.is_retryable());
    }
}
