// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prometheus-compatible metrics for the Matchcast client.
//!
//! # Features
//!
//! - Request counters per service, HTTP method and outcome
//! - Response time histograms per service
//! - Circuit breaker state gauges and rejection counters
//! - Cache hit and miss counters
//! - Instance pool gauges
//!
//! # Example
//!
//! ```rust
//! use matchcast_client::runtime::metrics::{MetricsCollector, MetricsConfig};
//!
//! let config = MetricsConfig::builder()
//!     .namespace("matchcast")
//!     .method_label(true)
//!     .build();
//!
//! let metrics = MetricsCollector::new(config);
//! metrics.record_request("backend", "GET", true, std::time::Duration::from_millis(42));
//!
//! let output = metrics.to_prometheus_text();
//! assert!(output.contains("matchcast_requests_total"));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Configuration for the metrics collector.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric namespace prefix (e.g., "matchcast" -> "matchcast_requests_total")
    pub namespace: String,
    /// Include the HTTP method as a label
    pub method_label: bool,
    /// Histogram buckets for response time (in seconds)
    pub histogram_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "matchcast_client".to_string(),
            method_label: true,
            histogram_buckets: vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

impl MetricsConfig {
    /// Create a new builder for `MetricsConfig`.
    pub fn builder() -> MetricsConfigBuilder {
        MetricsConfigBuilder::default()
    }
}

/// Builder for `MetricsConfig`.
#[derive(Debug, Default)]
pub struct MetricsConfigBuilder {
    namespace: Option<String>,
    method_label: Option<bool>,
    histogram_buckets: Option<Vec<f64>>,
}

impl MetricsConfigBuilder {
    /// Set the metric namespace prefix.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Enable or disable method labels.
    pub fn method_label(mut self, enabled: bool) -> Self {
        self.method_label = Some(enabled);
        self
    }

    /// Set histogram buckets for response time (in seconds).
    pub fn histogram_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.histogram_buckets = Some(buckets);
        self
    }

    /// Build the `MetricsConfig`.
    pub fn build(self) -> MetricsConfig {
        let default = MetricsConfig::default();
        MetricsConfig {
            namespace: self.namespace.unwrap_or(default.namespace),
            method_label: self.method_label.unwrap_or(default.method_label),
            histogram_buckets: self.histogram_buckets.unwrap_or(default.histogram_buckets),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct RequestLabels {
    service: String,
    method: Option<String>,
    status: &'static str,
}

/// A single histogram with cumulative bucket counters.
#[derive(Debug)]
struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_nanos: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_nanos: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value_secs: f64) {
        if let Some(first) = self.buckets.iter().position(|b| value_secs <= *b) {
            for counter in &self.counts[first..] {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
        // Values above every bucket only show up in +Inf, which is the total count.
        self.sum_nanos
            .fetch_add((value_secs * 1_000_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn sum_secs(&self) -> f64 {
        self.sum_nanos.load(Ordering::Relaxed) as f64 / 1_000_000_000.0
    }

    fn total_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct PoolGauge {
    healthy: AtomicU64,
    total: AtomicU64,
}

/// Read-mostly map of lazily created per-key metrics.
#[derive(Debug)]
struct Family<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K: std::hash::Hash + Eq + Clone, V> Family<K, V> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn with<R>(&self, key: &K, init: impl FnOnce() -> V, f: impl FnOnce(&V) -> R) -> R {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(value) = entries.get(key) {
                return f(value);
            }
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        f(entries.entry(key.clone()).or_insert_with(init))
    }

    fn read<R>(&self, f: impl FnOnce(&HashMap<K, V>) -> R) -> R {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f(&entries)
    }
}

/// Thread-safe metrics collector shared by every component of a client.
#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    /// Counter: requests_total{service, method, status}
    requests_total: Family<RequestLabels, AtomicU64>,
    /// Histogram: request_duration_seconds{service}
    request_duration: Family<String, Histogram>,
    /// Gauge: circuit_breaker_state{service} (0=closed, 1=half-open, 2=open)
    circuit_state: Family<String, AtomicU64>,
    /// Counter: circuit_breaker_rejections_total{service}
    circuit_rejections: Family<String, AtomicU64>,
    /// Gauges: pool_{healthy,total}_instances{service}
    pool: Family<String, PoolGauge>,
    /// Counter: pool_failovers_total
    pool_failovers: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    start_time: Instant,
}

impl MetricsCollector {
    /// Create a new metrics collector with the given configuration.
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            requests_total: Family::new(),
            request_duration: Family::new(),
            circuit_state: Family::new(),
            circuit_rejections: Family::new(),
            pool: Family::new(),
            pool_failovers: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Create a new metrics collector with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(MetricsConfig::default())
    }

    /// Record a completed request.
    pub fn record_request(&self, service: &str, method: &str, success: bool, duration: Duration) {
        let labels = RequestLabels {
            service: service.to_string(),
            method: self.config.method_label.then(|| method.to_string()),
            status: if success { "success" } else { "error" },
        };
        self.requests_total.with(
            &labels,
            || AtomicU64::new(0),
            |c| c.fetch_add(1, Ordering::Relaxed),
        );
        self.request_duration.with(
            &service.to_string(),
            || Histogram::new(self.config.histogram_buckets.clone()),
            |h| h.observe(duration.as_secs_f64()),
        );
    }

    /// Update a service's circuit breaker state (0=closed, 1=half-open, 2=open).
    pub fn set_circuit_state(&self, service: &str, state: u64) {
        self.circuit_state.with(
            &service.to_string(),
            || AtomicU64::new(0),
            |g| g.store(state, Ordering::Relaxed),
        );
    }

    /// Record a circuit breaker rejection.
    pub fn record_circuit_rejection(&self, service: &str) {
        self.circuit_rejections.with(
            &service.to_string(),
            || AtomicU64::new(0),
            |c| c.fetch_add(1, Ordering::Relaxed),
        );
    }

    /// Update instance pool gauges for a service.
    pub fn set_pool_instances(&self, service: &str, healthy: u64, total: u64) {
        self.pool.with(&service.to_string(), PoolGauge::default, |g| {
            g.healthy.store(healthy, Ordering::Relaxed);
            g.total.store(total, Ordering::Relaxed);
        });
    }

    /// Record a request served by an instance other than the first choice.
    pub fn record_pool_failover(&self) {
        self.pool_failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn sum_requests(&self, status: Option<&str>) -> u64 {
        self.requests_total.read(|counters| {
            counters
                .iter()
                .filter(|(labels, _)| status.is_none_or(|s| labels.status == s))
                .map(|(_, c)| c.load(Ordering::Relaxed))
                .sum()
        })
    }

    /// Get the total number of requests.
    pub fn total_requests(&self) -> u64 {
        self.sum_requests(None)
    }

    /// Get the number of successful requests.
    pub fn successful_requests(&self) -> u64 {
        self.sum_requests(Some("success"))
    }

    /// Get the number of failed requests.
    pub fn failed_requests(&self) -> u64 {
        self.sum_requests(Some("error"))
    }

    /// Rejections across all services.
    pub fn circuit_rejections(&self) -> u64 {
        self.circuit_rejections
            .read(|m| m.values().map(|c| c.load(Ordering::Relaxed)).sum())
    }

    /// Get client uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus_text(&self) -> String {
        let mut out = String::new();
        let ns = &self.config.namespace;

        header(&mut out, ns, "requests_total", "Total number of requests", "counter");
        self.requests_total.read(|counters| {
            let sorted: BTreeMap<_, _> = counters.iter().collect();
            for (labels, count) in sorted {
                let mut parts = vec![format!("service=\"{}\"", labels.service)];
                if let Some(ref method) = labels.method {
                    parts.push(format!("method=\"{method}\""));
                }
                parts.push(format!("status=\"{}\"", labels.status));
                let _ = writeln!(
                    out,
                    "{ns}_requests_total{{{}}} {}",
                    parts.join(","),
                    count.load(Ordering::Relaxed)
                );
            }
        });
        out.push('\n');

        header(
            &mut out,
            ns,
            "request_duration_seconds",
            "Request duration in seconds",
            "histogram",
        );
        self.request_duration.read(|histograms| {
            let sorted: BTreeMap<_, _> = histograms.iter().collect();
            for (service, hist) in sorted {
                for (bucket, count) in hist.buckets.iter().zip(&hist.counts) {
                    let _ = writeln!(
                        out,
                        "{ns}_request_duration_seconds_bucket{{service=\"{service}\",le=\"{bucket}\"}} {}",
                        count.load(Ordering::Relaxed)
                    );
                }
                let total = hist.total_count();
                let _ = writeln!(
                    out,
                    "{ns}_request_duration_seconds_bucket{{service=\"{service}\",le=\"+Inf\"}} {total}"
                );
                let _ = writeln!(
                    out,
                    "{ns}_request_duration_seconds_sum{{service=\"{service}\"}} {}",
                    hist.sum_secs()
                );
                let _ = writeln!(
                    out,
                    "{ns}_request_duration_seconds_count{{service=\"{service}\"}} {total}"
                );
            }
        });
        out.push('\n');

        header(
            &mut out,
            ns,
            "circuit_breaker_state",
            "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            "gauge",
        );
        per_service(&mut out, ns, "circuit_breaker_state", &self.circuit_state);
        out.push('\n');

        header(
            &mut out,
            ns,
            "circuit_breaker_rejections_total",
            "Requests rejected by circuit breaker",
            "counter",
        );
        per_service(
            &mut out,
            ns,
            "circuit_breaker_rejections_total",
            &self.circuit_rejections,
        );
        out.push('\n');

        let pools: Vec<(String, u64, u64)> = self.pool.read(|pools| {
            let sorted: BTreeMap<_, _> = pools.iter().collect();
            sorted
                .into_iter()
                .map(|(service, gauge)| {
                    (
                        service.clone(),
                        gauge.healthy.load(Ordering::Relaxed),
                        gauge.total.load(Ordering::Relaxed),
                    )
                })
                .collect()
        });
        header(
            &mut out,
            ns,
            "pool_healthy_instances",
            "Number of healthy instances in pool",
            "gauge",
        );
        for (service, healthy, _) in &pools {
            let _ = writeln!(
                out,
                "{ns}_pool_healthy_instances{{service=\"{service}\"}} {healthy}"
            );
        }
        header(&mut out, ns, "pool_total_instances", "Total instances in pool", "gauge");
        for (service, _, total) in &pools {
            let _ = writeln!(out, "{ns}_pool_total_instances{{service=\"{service}\"}} {total}");
        }
        out.push('\n');

        header(
            &mut out,
            ns,
            "pool_failovers_total",
            "Requests served by a non-preferred instance",
            "counter",
        );
        let _ = writeln!(
            out,
            "{ns}_pool_failovers_total {}\n",
            self.pool_failovers.load(Ordering::Relaxed)
        );

        header(&mut out, ns, "cache_hits_total", "Prediction cache hits", "counter");
        let _ = writeln!(
            out,
            "{ns}_cache_hits_total {}",
            self.cache_hits.load(Ordering::Relaxed)
        );
        header(&mut out, ns, "cache_misses_total", "Prediction cache misses", "counter");
        let _ = writeln!(
            out,
            "{ns}_cache_misses_total {}\n",
            self.cache_misses.load(Ordering::Relaxed)
        );

        header(&mut out, ns, "uptime_seconds", "Client uptime in seconds", "gauge");
        let _ = writeln!(out, "{ns}_uptime_seconds {}", self.uptime().as_secs_f64());

        out
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests(),
            successful_requests: self.successful_requests(),
            failed_requests: self.failed_requests(),
            circuit_states: self.circuit_state.read(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
                    .collect()
            }),
            circuit_rejections: self.circuit_rejections(),
            pool_failovers: self.pool_failovers.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            uptime: self.uptime(),
        }
    }
}

fn header(out: &mut String, ns: &str, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {ns}_{name} {help}");
    let _ = writeln!(out, "# TYPE {ns}_{name} {kind}");
}

fn per_service(out: &mut String, ns: &str, name: &str, family: &Family<String, AtomicU64>) {
    family.read(|values| {
        let sorted: BTreeMap<_, _> = values.iter().collect();
        for (service, value) in sorted {
            let _ = writeln!(
                out,
                "{ns}_{name}{{service=\"{service}\"}} {}",
                value.load(Ordering::Relaxed)
            );
        }
    });
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Snapshot of current metrics for programmatic access.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Circuit state gauge per service (0=closed, 1=half-open, 2=open)
    pub circuit_states: BTreeMap<String, u64>,
    pub circuit_rejections: u64,
    pub pool_failovers: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub uptime: Duration,
}
