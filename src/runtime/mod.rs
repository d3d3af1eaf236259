// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runtime utilities for resilience and observability.
//!
//! Retry with backoff, circuit breakers, metrics and request spans shared
//! by every service the client talks to.

mod circuit_breaker;
pub mod metrics;
mod retry;
pub mod tracing;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use metrics::{MetricsCollector, MetricsConfig, MetricsSnapshot};
pub use retry::{
    BackoffStrategy, DefaultRetryPolicy, ExponentialBackoff, FixedBackoff, NoBackoff,
    NoRetryPolicy, PredicateRetryPolicy, RetryConfig, RetryConfigBuilder, RetryPolicy,
};
pub use self::tracing::{CallSpan, SpanFactory, TracingConfig};
