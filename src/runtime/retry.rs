// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policies and backoff strategies for resilient API calls.
//!
//! An operation is attempted up to `max_attempts` times. Errors the policy
//! classifies as terminal are returned immediately; retryable errors are
//! followed by a sleep whose length grows according to the backoff strategy.
//! After the last attempt the most recent error is returned unchanged.
//!
//! # Example
//!
//! ```
//! use matchcast_client::runtime::{RetryConfig, ExponentialBackoff};
//! use std::time::Duration;
//!
//! let retry = RetryConfig::builder()
//!     .max_attempts(3)
//!     .backoff(ExponentialBackoff::new(Duration::from_millis(100)))
//!     .build();
//! assert!(retry.validate().is_ok());
//! ```

use crate::error::{ClientError, Classify, ErrorClass, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Defines a backoff strategy for retry delays.
pub trait BackoffStrategy: Clone + Send + Sync + 'static {
    /// Delay before the second attempt.
    fn initial_delay(&self) -> Duration;

    /// Delay to use after `current` has been slept.
    fn next_delay(&self, current: Duration) -> Duration;
}

// =============================================================================
// No Backoff
// =============================================================================

/// No delay between retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl NoBackoff {
    /// Create a new no-backoff strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl BackoffStrategy for NoBackoff {
    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn next_delay(&self, _current: Duration) -> Duration {
        Duration::ZERO
    }
}

// =============================================================================
// Fixed Backoff
// =============================================================================

/// Fixed delay between retries.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    /// Create a new fixed backoff strategy.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Create a fixed backoff with delay in milliseconds.
    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl BackoffStrategy for FixedBackoff {
    fn initial_delay(&self) -> Duration {
        self.delay
    }

    fn next_delay(&self, _current: Duration) -> Duration {
        self.delay
    }
}

// =============================================================================
// Exponential Backoff
// =============================================================================

/// Exponential backoff with additive random jitter.
///
/// `next = min(current * multiplier + random(0..jitter), max_delay)`
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: Duration,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff strategy.
    #[must_use]
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: Duration::from_millis(1000),
        }
    }

    /// Set the maximum delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the multiplier for exponential growth.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the upper bound of the random jitter. `Duration::ZERO` disables it.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    #[must_use]
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn initial_delay(&self) -> Duration {
        self.initial_delay.min(self.max_delay)
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let jitter_ms = if self.jitter.is_zero() {
            0.0
        } else {
            rand::random::<f64>() * self.jitter.as_millis() as f64
        };
        let next_ms = current.as_millis() as f64 * self.multiplier + jitter_ms;
        let capped = next_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Determines whether an error should be retried.
pub trait RetryPolicy: Clone + Send + Sync + 'static {
    /// Returns `true` if the operation should be retried for this error.
    fn should_retry(&self, class: ErrorClass) -> bool;
}

/// Default retry policy: network failures and 5xx responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, class: ErrorClass) -> bool {
        match class {
            ErrorClass::Network => true,
            ErrorClass::Status(code) => code.is_server_error(),
            ErrorClass::Rejected | ErrorClass::Other => false,
        }
    }
}

/// Never retry - fail immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn should_retry(&self, _class: ErrorClass) -> bool {
        false
    }
}

/// Retry policy backed by a caller-supplied predicate.
#[derive(Clone)]
pub struct PredicateRetryPolicy {
    predicate: Arc<dyn Fn(ErrorClass) -> bool + Send + Sync>,
}

impl PredicateRetryPolicy {
    #[must_use]
    pub fn new(predicate: impl Fn(ErrorClass) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for PredicateRetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateRetryPolicy").finish_non_exhaustive()
    }
}

impl RetryPolicy for PredicateRetryPolicy {
    fn should_retry(&self, class: ErrorClass) -> bool {
        (self.predicate)(class)
    }
}

// =============================================================================
// Retry Configuration
// =============================================================================

/// Complete retry configuration combining policy and backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig<P: RetryPolicy = DefaultRetryPolicy, B: BackoffStrategy = ExponentialBackoff>
{
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Policy determining which errors to retry.
    pub policy: P,
    /// Backoff strategy for calculating delays.
    pub backoff: B,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            policy: DefaultRetryPolicy,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> RetryConfigBuilder<DefaultRetryPolicy, ExponentialBackoff> {
        RetryConfigBuilder::new()
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn disabled() -> RetryConfig<NoRetryPolicy, NoBackoff> {
        RetryConfig {
            max_attempts: 1,
            policy: NoRetryPolicy,
            backoff: NoBackoff,
        }
    }
}

impl<P: RetryPolicy, B: BackoffStrategy> RetryConfig<P, B> {
    /// Check the configuration for values the retry loop cannot honor.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` when `max_attempts` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ClientError::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Execute an async operation with retry logic.
    ///
    /// The error of the final attempt is returned as-is.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.backoff.initial_delay();
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !self.policy.should_retry(e.class()) {
                        return Err(e);
                    }

                    if attempt >= max_attempts {
                        error!(attempts = max_attempts, error = %e, "All attempts failed");
                        return Err(e);
                    }

                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;

                    delay = self.backoff.next_delay(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Builder for `RetryConfig`.
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder<P: RetryPolicy, B: BackoffStrategy> {
    max_attempts: u32,
    policy: P,
    backoff: B,
}

impl RetryConfigBuilder<DefaultRetryPolicy, ExponentialBackoff> {
    /// Create a new builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            policy: DefaultRetryPolicy,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl Default for RetryConfigBuilder<DefaultRetryPolicy, ExponentialBackoff> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: RetryPolicy, B: BackoffStrategy> RetryConfigBuilder<P, B> {
    /// Set the total number of attempts.
    #[must_use]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn policy<P2: RetryPolicy>(self, policy: P2) -> RetryConfigBuilder<P2, B> {
        RetryConfigBuilder {
            max_attempts: self.max_attempts,
            policy,
            backoff: self.backoff,
        }
    }

    /// Set the backoff strategy.
    #[must_use]
    pub fn backoff<B2: BackoffStrategy>(self, backoff: B2) -> RetryConfigBuilder<P, B2> {
        RetryConfigBuilder {
            max_attempts: self.max_attempts,
            policy: self.policy,
            backoff,
        }
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> RetryConfig<P, B> {
        RetryConfig {
            max_attempts: self.max_attempts,
            policy: self.policy,
            backoff: self.backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_no_backoff() {
        let backoff = NoBackoff::new();
        assert_eq!(backoff.initial_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(Duration::from_secs(5)), Duration::ZERO);
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = FixedBackoff::from_millis(100);
        assert_eq!(backoff.initial_delay(), Duration::from_millis(100));
        assert_eq!(
            backoff.next_delay(Duration::from_millis(100)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(Duration::ZERO);

        let d0 = backoff.initial_delay();
        let d1 = backoff.next_delay(d0);
        let d2 = backoff.next_delay(d1);
        assert_eq!(d0, Duration::from_millis(100));
        assert_eq!(d1, Duration::from_millis(200));
        assert_eq!(d2, Duration::from_millis(400));
    }

    #[test]
    fn test_exponential_backoff_jitter_bounds() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(1000))
            .with_max_delay(Duration::from_secs(60));

        for _ in 0..100 {
            let next = backoff.next_delay(Duration::from_millis(1000));
            assert!(next >= Duration::from_millis(2000));
            assert!(next <= Duration::from_millis(3000));
        }
    }

    #[test]
    fn test_exponential_backoff_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(1000))
            .with_max_delay(Duration::from_millis(1500));

        assert_eq!(
            backoff.next_delay(Duration::from_millis(1000)),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = DefaultRetryPolicy;

        assert!(policy.should_retry(ErrorClass::Network));
        assert!(policy.should_retry(ErrorClass::Status(StatusCode::INTERNAL_SERVER_ERROR)));
        assert!(policy.should_retry(ErrorClass::Status(StatusCode::SERVICE_UNAVAILABLE)));

        assert!(!policy.should_retry(ErrorClass::Status(StatusCode::NOT_FOUND)));
        assert!(!policy.should_retry(ErrorClass::Status(StatusCode::BAD_REQUEST)));
        assert!(!policy.should_retry(ErrorClass::Rejected));
        assert!(!policy.should_retry(ErrorClass::Other));
    }

    #[test]
    fn test_no_retry_policy() {
        assert!(!NoRetryPolicy.should_retry(ErrorClass::Network));
    }

    #[test]
    fn test_predicate_retry_policy() {
        let policy = PredicateRetryPolicy::new(|class| {
            matches!(class, ErrorClass::Status(code) if code == StatusCode::TOO_MANY_REQUESTS)
        });
        assert!(policy.should_retry(ErrorClass::Status(StatusCode::TOO_MANY_REQUESTS)));
        assert!(!policy.should_retry(ErrorClass::Network));
    }

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::builder()
            .max_attempts(5)
            .backoff(FixedBackoff::from_millis(200))
            .build();

        assert_eq!(config.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_config_rejects_zero_attempts() {
        let config = RetryConfig::builder().max_attempts(0).build();
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_retry_config_disabled() {
        let config = RetryConfig::disabled();
        assert_eq!(config.max_attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_execute_success() {
        let config = RetryConfig::default();

        let result: std::result::Result<i32, ClientError> =
            config.execute(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_execute_transient_failure() {
        let config = RetryConfig::builder().max_attempts(3).build();
        let call_count = Arc::new(AtomicU32::new(0));
        let counter = call_count.clone();

        let result = config
            .execute(|| {
                let count = counter.clone();
                async move {
                    let n = count.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ClientError::Network("connection reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_surfaces_last_error() {
        let config = RetryConfig::builder().max_attempts(3).build();
        let call_count = Arc::new(AtomicU32::new(0));
        let counter = call_count.clone();

        let result: std::result::Result<(), ClientError> = config
            .execute(|| {
                let count = counter.clone();
                async move {
                    let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(ClientError::from_status(
                        StatusCode::SERVICE_UNAVAILABLE,
                        format!("attempt {n}"),
                    ))
                }
            })
            .await;

        assert_eq!(call_count.load(Ordering::SeqCst), 3);
        match result {
            Err(ClientError::Server { message, .. }) => assert_eq!(message, "attempt 3"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_sleeps_between_attempts() {
        let config = RetryConfig::builder()
            .max_attempts(3)
            .backoff(
                ExponentialBackoff::new(Duration::from_millis(100)).with_jitter(Duration::ZERO),
            )
            .build();
        let start = tokio::time::Instant::now();

        let _: std::result::Result<(), ClientError> = config
            .execute(|| async { Err(ClientError::Network("down".into())) })
            .await;

        // 100ms before attempt 2, 200ms before attempt 3.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_retry_execute_permanent_failure() {
        let config = RetryConfig::builder().max_attempts(3).build();
        let call_count = Arc::new(AtomicU32::new(0));
        let counter = call_count.clone();

        let result: std::result::Result<(), ClientError> = config
            .execute(|| {
                let count = counter.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(ClientError::from_status(StatusCode::NOT_FOUND, "no such match"))
                }
            })
            .await;

        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().status(), Some(StatusCode::NOT_FOUND));
    }
}
