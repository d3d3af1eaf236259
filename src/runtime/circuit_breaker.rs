// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit breaker pattern implementation for resilient API calls.
//!
//! The circuit breaker prevents cascading failures by temporarily stopping
//! requests to a failing service and probing it before fully resuming.
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Requests immediately fail with [`ClientError::CircuitOpen`]
//! - **Half-Open**: A limited number of probe requests are let through
//!
//! # State Transitions
//!
//! ```text
//! Closed    → Open:      failure_count >= failure_threshold
//! Open      → Half-Open: first call at or after next_attempt_at
//! Half-Open → Closed:    success_count >= success_threshold
//! Half-Open → Open:      any failure
//! ```
//!
//! All counters of one breaker live behind a single mutex, so concurrent
//! callers cannot both observe `Closed` and race past the threshold.
//!
//! # Example
//!
//! ```
//! use matchcast_client::runtime::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::default()
//!     .with_failure_threshold(5)
//!     .with_reset_timeout(Duration::from_secs(30));
//!
//! let breaker = CircuitBreaker::new("backend", config);
//! assert!(breaker.can_execute());
//! ```

use crate::error::{ClientError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally.
    Closed,
    /// Circuit is open, requests fail immediately.
    Open,
    /// Circuit is half-open, testing if service has recovered.
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding used by the metrics collector.
    #[must_use]
    pub fn as_gauge(self) -> u64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: usize,
    /// Number of successes in half-open state before closing.
    pub success_threshold: usize,
    /// How long the circuit stays open before a probe is allowed.
    pub reset_timeout: Duration,
    /// Maximum number of in-flight probes in half-open state.
    pub half_open_max_requests: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the primary backend API.
    #[must_use]
    pub fn backend() -> Self {
        Self::default()
    }

    /// Preset for the ML service: trips faster and stays open longer.
    #[must_use]
    pub fn ml() -> Self {
        Self::default()
            .with_failure_threshold(3)
            .with_reset_timeout(Duration::from_secs(60))
    }

    /// Set the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold for recovery.
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the reset timeout.
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the maximum concurrent half-open probes.
    #[must_use]
    pub fn with_half_open_max_requests(mut self, max: usize) -> Self {
        self.half_open_max_requests = max;
        self
    }

    /// # Errors
    ///
    /// Returns `ClientError::Config` when any threshold is zero.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(ClientError::Config(
                "circuit failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(ClientError::Config(
                "circuit success_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_max_requests == 0 {
            return Err(ClientError::Config(
                "circuit half_open_max_requests must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: usize,
    success_count: usize,
    next_attempt_at: Option<Instant>,
    half_open_in_flight: usize,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: usize,
    pub retry_after: Option<Duration>,
}

/// Circuit breaker for protecting one named service.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

enum Admission {
    Normal,
    Probe,
}

/// Releases a half-open slot even if the guarded future is dropped.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        let mut inner = self.breaker.lock();
        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt_at: None,
                half_open_in_flight: 0,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Create a circuit breaker with default configuration.
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stored state. An expired `Open` stays `Open` until the next call.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call issued now would be let through.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .next_attempt_at
                .is_none_or(|at| Instant::now() >= at),
            CircuitState::HalfOpen => {
                inner.half_open_in_flight < self.config.half_open_max_requests
            }
        }
    }

    fn admit(&self) -> Result<Admission> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let now = Instant::now();
            match inner.next_attempt_at {
                Some(at) if now < at => {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    return Err(ClientError::CircuitOpen {
                        service: self.name.clone(),
                        retry_after: Some(at - now),
                    });
                }
                _ => {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.half_open_in_flight = 0;
                    info!(service = %self.name, "Circuit breaker entering HALF_OPEN");
                }
            }
        }

        match inner.state {
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_requests {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    return Err(ClientError::CircuitOpen {
                        service: self.name.clone(),
                        retry_after: None,
                    });
                }
                inner.half_open_in_flight += 1;
                Ok(Admission::Probe)
            }
            _ => Ok(Admission::Normal),
        }
    }

    /// Execute an async operation with circuit breaker protection.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::CircuitOpen` without running the operation if
    /// the circuit is open. Otherwise returns the operation's own error.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let _slot = match self.admit()? {
            Admission::Probe => Some(ProbeSlot { breaker: self }),
            Admission::Normal => None,
        };

        match operation().await {
            Ok(result) => {
                self.on_success();
                Ok(result)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    /// Record a successful operation.
    pub fn on_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.success_count = 0;
                inner.failure_count = 0;
                inner.next_attempt_at = None;
                info!(service = %self.name, "Circuit breaker CLOSED");
            }
        }
    }

    /// Record a failed operation.
    pub fn on_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        inner.success_count = 0;

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                self.open(&mut inner);
            }
            // A straggler from before the trip; the timer is already running.
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.next_attempt_at = Some(Instant::now() + self.config.reset_timeout);
        error!(
            service = %self.name,
            retry_in_ms = self.config.reset_timeout.as_millis() as u64,
            "Circuit breaker OPEN"
        );
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_in_flight = 0;
        inner.next_attempt_at = None;
    }

    /// Get the time until the circuit admits a probe (if open).
    #[must_use]
    pub fn time_until_retry(&self) -> Option<Duration> {
        let inner = self.lock();
        if inner.state != CircuitState::Open {
            return None;
        }
        inner
            .next_attempt_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Get the current consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.lock().failure_count
    }

    /// Get the half-open success count.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.lock().success_count
    }

    /// Get total number of calls.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Get total number of failures.
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Get total number of rejections (circuit open).
    #[must_use]
    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 to 1.0).
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_calls.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let failures = self.total_failures.load(Ordering::Relaxed);
        failures as f64 / total as f64
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let retry_after = match inner.state {
            CircuitState::Open => inner
                .next_attempt_at
                .map(|at| at.saturating_duration_since(Instant::now())),
            _ => None,
        };
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            retry_after,
        }
    }

    /// Get the circuit breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// Lazily created breakers, one per service name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    service_configs: HashMap<String, CircuitBreakerConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
            .with_service_config("backend", CircuitBreakerConfig::backend())
            .with_service_config("ml", CircuitBreakerConfig::ml())
    }
}

impl CircuitBreakerRegistry {
    /// A registry with no per-service overrides.
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            service_configs: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Override the configuration used when `service`'s breaker is created.
    #[must_use]
    pub fn with_service_config(
        mut self,
        service: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.service_configs.insert(service.into(), config);
        self
    }

    /// # Errors
    ///
    /// Returns the first invalid breaker configuration found.
    pub fn validate(&self) -> Result<()> {
        self.default_config.validate()?;
        for config in self.service_configs.values() {
            config.validate()?;
        }
        Ok(())
    }

    /// Get the breaker for `service`, creating it on first use.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self
                    .service_configs
                    .get(service)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(CircuitBreaker::new(service, config))
            })
            .clone()
    }

    /// Snapshots of every breaker created so far.
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        for breaker in breakers.values() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>(ClientError::Network("test".to_string())) })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<&'static str> {
        breaker.execute(|| async { Ok("ok") }).await
    }

    #[test]
    fn test_circuit_breaker_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_service_presets() {
        let ml = CircuitBreakerConfig::ml();
        assert_eq!(ml.failure_threshold, 3);
        assert_eq!(ml.success_threshold, 2);
        assert_eq!(ml.reset_timeout, Duration::from_secs(60));
        assert_eq!(CircuitBreakerConfig::backend().failure_threshold, 5);
    }

    #[test]
    fn test_config_rejects_zero_thresholds() {
        assert!(CircuitBreakerConfig::new()
            .with_failure_threshold(0)
            .validate()
            .is_err());
        assert!(CircuitBreakerConfig::new()
            .with_success_threshold(0)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_circuit_breaker_initial_state() {
        let breaker = CircuitBreaker::with_defaults("backend");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }

    #[tokio::test]
    async fn test_opens_exactly_on_nth_failure() {
        for threshold in 1..=6 {
            let config = CircuitBreakerConfig::new().with_failure_threshold(threshold);
            let breaker = CircuitBreaker::new("svc", config);

            for _ in 0..threshold - 1 {
                fail(&breaker).await;
                assert_eq!(breaker.state(), CircuitState::Closed);
            }
            fail(&breaker).await;
            assert_eq!(breaker.state(), CircuitState::Open);
        }
    }

    #[tokio::test]
    async fn test_rejects_when_open_without_running_operation() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_reset_timeout(Duration::from_secs(60));
        let breaker = CircuitBreaker::new("ml", config);

        fail(&breaker).await;
        fail(&breaker).await;

        let mut ran = false;
        let result = breaker
            .execute(|| {
                ran = true;
                async { Ok::<_, ClientError>("success") }
            })
            .await;

        assert!(!ran);
        assert!(matches!(
            result,
            Err(ClientError::CircuitOpen { ref service, .. }) if service == "ml"
        ));
        assert_eq!(breaker.total_rejections(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let config = CircuitBreakerConfig::new().with_failure_threshold(3);
        let breaker = CircuitBreaker::new("svc", config);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.failure_count(), 2);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);

        // The next two failures are not consecutive with the first two.
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset() {
        let config = CircuitBreakerConfig::new().with_failure_threshold(2);
        let breaker = CircuitBreaker::new("svc", config);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
        assert!(breaker.time_until_retry().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_call_after_timeout_enters_half_open() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_success_threshold(2)
            .with_reset_timeout(Duration::from_millis(50));
        let breaker = CircuitBreaker::new("svc", config);

        fail(&breaker).await;
        fail(&breaker).await;
        assert!(!breaker.can_execute());

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(breaker.can_execute());
        // Stored state only changes when a call arrives.
        assert_eq!(breaker.state(), CircuitState::Open);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.success_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closes_after_success_threshold_in_half_open() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_success_threshold(3)
            .with_reset_timeout(Duration::from_millis(10));
        let breaker = CircuitBreaker::new("svc", config);

        fail(&breaker).await;
        fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(20)).await;

        for _ in 0..3 {
            succeed(&breaker).await.unwrap();
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.success_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_half_open_failure_reopens() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(5)
            .with_reset_timeout(Duration::from_secs(30));
        let breaker = CircuitBreaker::new("svc", config);

        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        let retry = breaker.time_until_retry().unwrap();
        assert_eq!(retry, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_probes() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_millis(10))
            .with_half_open_max_requests(1);
        let breaker = Arc::new(CircuitBreaker::new("svc", config));

        fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(20)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_breaker = breaker.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, ClientError>(())
                })
                .await
        });
        tokio::task::yield_now().await;

        let second = succeed(&breaker).await;
        assert!(matches!(second, Err(ClientError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert!(breaker.can_execute());
    }

    #[tokio::test]
    async fn test_failure_rate() {
        let breaker = CircuitBreaker::with_defaults("svc");
        assert_eq!(breaker.failure_rate(), 0.0);

        for _ in 0..4 {
            succeed(&breaker).await.unwrap();
        }
        fail(&breaker).await;

        assert!((breaker.failure_rate() - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_registry_creates_per_service_breakers() {
        let registry = CircuitBreakerRegistry::default();

        let backend = registry.get("backend");
        let ml = registry.get("ml");
        let other = registry.get("news");

        assert_eq!(backend.config().failure_threshold, 5);
        assert_eq!(ml.config().failure_threshold, 3);
        assert_eq!(other.config(), &CircuitBreakerConfig::default());
        assert!(Arc::ptr_eq(&backend, &registry.get("backend")));
        assert_eq!(registry.snapshots().len(), 3);
    }

    #[tokio::test]
    async fn test_registry_reset_all() {
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::new().with_failure_threshold(1),
        );
        fail(&registry.get("a")).await;
        fail(&registry.get("b")).await;

        registry.reset_all();
        assert!(registry
            .snapshots()
            .iter()
            .all(|s| s.state == CircuitState::Closed));
    }
}
