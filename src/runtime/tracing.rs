// SPDX-License-Identifier: MIT OR Apache-2.0

//! Span helpers for outbound HTTP calls.
//!
//! Every request the client issues runs inside a [`CallSpan`] carrying
//! OpenTelemetry-style attributes. The library only depends on `tracing`;
//! exporting spans is left to whichever subscriber the application installs.
//!
//! # Example
//!
//! ```rust
//! use matchcast_client::runtime::tracing::CallSpan;
//! use std::time::Duration;
//!
//! let span = CallSpan::new("GET", "backend", "https://api.matchcast.example");
//! span.record_status(200, Duration::from_millis(42));
//! ```
//!
//! # Semantic Conventions
//!
//! | Attribute | Description |
//! |-----------|-------------|
//! | `client.name` | `TracingConfig::service_name` of the calling client |
//! | `http.request.method` | HTTP method |
//! | `service` | Logical service name (e.g., "backend", "ml") |
//! | `server.address` | Base URL of the chosen instance |
//! | `http.response.status_code` | Final HTTP status, if any |
//! | `otel.status_code` | "OK" or "ERROR" |

use std::time::Duration;
use tokio::time::Instant;
use tracing::{field, info_span, Span};

/// Configuration for request spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Name reported as the client in logs and spans
    pub service_name: String,
    /// Whether to record request paths (may contain identifiers)
    pub record_paths: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "matchcast-client".to_string(),
            record_paths: true,
        }
    }
}

impl TracingConfig {
    /// Create a new builder for `TracingConfig`.
    pub fn builder() -> TracingConfigBuilder {
        TracingConfigBuilder::default()
    }
}

/// Builder for `TracingConfig`.
#[derive(Debug, Default)]
pub struct TracingConfigBuilder {
    service_name: Option<String>,
    record_paths: Option<bool>,
}

impl TracingConfigBuilder {
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn record_paths(mut self, enabled: bool) -> Self {
        self.record_paths = Some(enabled);
        self
    }

    pub fn build(self) -> TracingConfig {
        let default = TracingConfig::default();
        TracingConfig {
            service_name: self.service_name.unwrap_or(default.service_name),
            record_paths: self.record_paths.unwrap_or(default.record_paths),
        }
    }
}

/// A span for one logical client call, retries included.
#[derive(Debug)]
pub struct CallSpan {
    span: Span,
    start: Instant,
    service: String,
}

impl CallSpan {
    pub fn new(method: &str, service: &str, address: &str) -> Self {
        let span = info_span!(
            "matchcast.http",
            client.name = field::Empty,
            http.request.method = %method,
            service = %service,
            server.address = %address,
            url.path = field::Empty,
            http.response.status_code = field::Empty,
            otel.status_code = field::Empty,
            error.message = field::Empty,
            duration_ms = field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            service: service.to_string(),
        }
    }

    /// Name the calling client.
    pub fn record_client(&self, name: &str) {
        self.span.record("client.name", name);
    }

    /// Attach the request path.
    pub fn record_path(&self, path: &str) {
        self.span.record("url.path", path);
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Get elapsed time since span creation.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record a response status.
    pub fn record_status(&self, status: u16, duration: Duration) {
        self.span.record("http.response.status_code", i64::from(status));
        let otel = if status < 400 { "OK" } else { "ERROR" };
        self.span.record("otel.status_code", otel);
        self.span.record("duration_ms", duration.as_millis() as i64);
    }

    /// Record a failure, with the status if a response was received.
    pub fn record_error(&self, status: Option<u16>, error: &str) {
        if let Some(status) = status {
            self.span.record("http.response.status_code", i64::from(status));
        }
        self.span.record("otel.status_code", "ERROR");
        self.span.record("error.message", error);
        self.span
            .record("duration_ms", self.start.elapsed().as_millis() as i64);
    }
}

/// Span factory for creating consistent spans across the client.
#[derive(Debug, Clone, Default)]
pub struct SpanFactory {
    config: TracingConfig,
}

impl SpanFactory {
    pub fn new(config: TracingConfig) -> Self {
        Self { config }
    }

    /// Create a span for a call to `service` at `address`.
    pub fn call(&self, method: &str, service: &str, address: &str, path: &str) -> CallSpan {
        let span = CallSpan::new(method, service, address);
        span.record_client(&self.config.service_name);
        if self.config.record_paths {
            span.record_path(path);
        }
        span
    }

    pub fn config(&self) -> &TracingConfig {
        &self.config
    }
}
