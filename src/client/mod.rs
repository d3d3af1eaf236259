// SPDX-License-Identifier: MIT OR Apache-2.0

//! The resilient client and the components it composes.
//!
//! [`ResilientClient`] is the single entry point for outgoing calls. For
//! every request it:
//!
//! 1. routes the endpoint to a logical service,
//! 2. picks an instance from the [`InstanceBalancer`] (services without a
//!    pool use their configured base URL),
//! 3. warns if the [`ServiceMesh`] reports the service as not healthy,
//! 4. holds a [`ConnectionGuard`] on the instance for the whole call,
//! 5. runs the transport call through the service's circuit breaker, with
//!    the retrier inside the breaker,
//! 6. marks the instance healthy or unhealthy from the aggregate outcome,
//! 7. releases the connection,
//! 8. reports the outcome to the error-budget sink.
//!
//! GET requests carrying a [`CacheDirective`] are answered from the
//! [`PredictionCache`] when possible, skipping every step above.

mod budget;
mod mesh;
mod pool;

pub use budget::{
    BudgetEvent, BudgetReport, BudgetSink, BudgetStatus, ErrorBudgetTracker,
    DEFAULT_TARGET_RELIABILITY,
};
pub use mesh::{HealthStatus, MeshConfig, MeshHandle, MeshService, ServiceHealth, ServiceMesh};
pub use pool::{
    AllUnhealthyPolicy, BackendInstance, ConnectionGuard, InstanceBalancer, InstanceStats,
    PoolConfig,
};

use crate::cache::{PredictionCache, SetOptions, DEFAULT_CONFIDENCE};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::runtime::{
    CircuitBreakerRegistry, MetricsCollector, RetryConfig, SpanFactory, TracingConfig,
};
use crate::transport::{HttpRequest, ReqwestTransport, Transport};
use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};
use url::Url;

/// Cache instructions for one GET request.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheDirective {
    pub key: String,
    pub category: String,
    /// Confidence to store. Takes precedence over `confidence_pointer`.
    pub confidence: Option<f64>,
    /// JSON pointer (e.g. `/prediction/confidence`) into the response body
    /// naming a numeric confidence.
    pub confidence_pointer: Option<String>,
}

impl CacheDirective {
    #[must_use]
    pub fn new(key: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            category: category.into(),
            confidence: None,
            confidence_pointer: None,
        }
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    #[must_use]
    pub fn with_confidence_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.confidence_pointer = Some(pointer.into());
        self
    }

    fn confidence_for(&self, body: &Value) -> f64 {
        self.confidence
            .or_else(|| {
                self.confidence_pointer
                    .as_deref()
                    .and_then(|p| body.pointer(p))
                    .and_then(Value::as_f64)
            })
            .unwrap_or(DEFAULT_CONFIDENCE)
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub cache: Option<CacheDirective>,
    /// Skip the cache lookup. A successful response is still written.
    pub bypass_cache: bool,
    /// Pick the instance with the fewest active connections instead of
    /// weighted round-robin.
    pub least_connections: bool,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn cached(mut self, directive: CacheDirective) -> Self {
        self.cache = Some(directive);
        self
    }

    #[must_use]
    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    #[must_use]
    pub fn least_connections(mut self) -> Self {
        self.least_connections = true;
        self
    }
}

/// Where a request goes.
struct Target {
    service: String,
    base: Url,
    instance: Option<Arc<BackendInstance>>,
}

/// Builder for [`ResilientClient`].
#[derive(Debug)]
pub struct ResilientClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    budget: Option<BudgetSink>,
    metrics: Option<Arc<MetricsCollector>>,
    tracing: TracingConfig,
}

impl ResilientClientBuilder {
    /// Use `transport` instead of a `reqwest` client.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Report every call outcome to `sink`.
    ///
    /// The channel is unbounded: the receiving end must be drained, for
    /// example with [`ErrorBudgetTracker::spawn_consumer`].
    #[must_use]
    pub fn budget_sink(mut self, sink: BudgetSink) -> Self {
        self.budget = Some(sink);
        self
    }

    /// Share a metrics collector with other components.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn tracing(mut self, config: TracingConfig) -> Self {
        self.tracing = config;
        self
    }

    /// Validate the configuration and assemble the client.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` for an invalid configuration, or if the
    /// default transport cannot be built.
    pub fn build(self) -> Result<ResilientClient> {
        let config = self.config;
        config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(config.request_timeout())?),
        };

        let base_urls = config
            .services
            .iter()
            .filter_map(|(name, s)| s.base_url.as_deref().map(|b| (name, b)))
            .map(|(name, b)| Ok((name.clone(), Url::parse(b)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let mesh = if config.mesh.enabled {
            Some(Arc::new(ServiceMesh::new(
                config.mesh_config()?,
                Arc::clone(&transport),
            )))
        } else {
            None
        };

        let balancer = InstanceBalancer::from_config(&config)?;
        let metrics = self.metrics.unwrap_or_default();
        for service in balancer.services() {
            metrics.set_pool_instances(
                service,
                balancer.healthy_count(service) as u64,
                balancer.instances(service).len() as u64,
            );
        }

        info!(
            services = config.services.len(),
            pooled = balancer.services().count(),
            mesh = mesh.is_some(),
            "Resilient client ready"
        );

        Ok(ResilientClient {
            retry: config.retry_config(),
            breakers: Arc::new(config.circuit_registry()),
            cache: Arc::new(PredictionCache::new(config.cache_config())?),
            balancer: Arc::new(balancer),
            spans: SpanFactory::new(self.tracing),
            budget: self.budget,
            transport,
            base_urls: Arc::new(base_urls),
            mesh,
            metrics,
            config: Arc::new(config),
        })
    }
}

/// Resilient client for the MatchCast services.
///
/// Cheap to clone; clones share every component.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    balancer: Arc<InstanceBalancer>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryConfig,
    mesh: Option<Arc<ServiceMesh>>,
    cache: Arc<PredictionCache<Value>>,
    metrics: Arc<MetricsCollector>,
    spans: SpanFactory,
    budget: Option<BudgetSink>,
    base_urls: Arc<BTreeMap<String, Url>>,
}

impl ResilientClient {
    /// A client over `reqwest`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` for an invalid configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn builder(config: ClientConfig) -> ResilientClientBuilder {
        ResilientClientBuilder {
            config,
            transport: None,
            budget: None,
            metrics: None,
            tracing: TracingConfig::default(),
        }
    }

    /// Issue a request and parse the response body into `T`.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error, `ClientError::CircuitOpen` without
    /// touching the network while the service's circuit is open,
    /// `ClientError::NoInstance` when no instance can be chosen, or
    /// `ClientError::Decode` if the body does not parse into `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<T> {
        let directive = options.cache.as_ref().filter(|_| method == Method::GET);

        if let Some(directive) = directive.filter(|_| !options.bypass_cache) {
            if let Some(value) = self.cache.get(&directive.key) {
                self.metrics.record_cache_hit();
                debug!(key = %directive.key, "Serving from cache");
                return Ok(serde_json::from_value(value)?);
            }
            self.metrics.record_cache_miss();
        }

        let body = body.map(|b| serde_json::to_vec(&b)).transpose()?;
        let bytes = self
            .execute(method, endpoint, body.map(Bytes::from), options.headers, options.least_connections)
            .await?;

        let value: Value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };

        if let Some(directive) = directive {
            let confidence = directive.confidence_for(&value);
            self.cache.set(
                directive.key.clone(),
                value.clone(),
                SetOptions::category(directive.category.clone()).confidence(confidence),
            );
        }

        Ok(serde_json::from_value(value)?)
    }

    /// GET `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`ResilientClient::request`].
    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T> {
        self.request(Method::GET, endpoint, None, options).await
    }

    /// POST `body` as JSON to `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`ResilientClient::request`].
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        self.request(Method::POST, endpoint, Some(body), options).await
    }

    /// PUT `body` as JSON to `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`ResilientClient::request`].
    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        self.request(Method::PUT, endpoint, Some(body), options).await
    }

    /// DELETE `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`ResilientClient::request`].
    pub async fn delete<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T> {
        self.request(Method::DELETE, endpoint, None, options).await
    }

    fn target(&self, service: &str, least_connections: bool) -> Result<Target> {
        if self.balancer.has_service(service) {
            let all_unhealthy = self.balancer.healthy_count(service) == 0;
            let selected = if least_connections {
                self.balancer
                    .select_least_connections(service)
                    .or_else(|| self.balancer.select_instance(service))
            } else {
                self.balancer.select_instance(service)
            };
            let instance = selected.ok_or_else(|| ClientError::NoInstance(service.to_string()))?;
            if all_unhealthy {
                self.metrics.record_pool_failover();
            }
            return Ok(Target {
                base: instance.url().clone(),
                instance: Some(instance),
                service: service.to_string(),
            });
        }

        match self.base_urls.get(service) {
            Some(base) => Ok(Target {
                base: base.clone(),
                instance: None,
                service: service.to_string(),
            }),
            None => Err(ClientError::NoInstance(service.to_string())),
        }
    }

    /// Step 8 plus request metrics; runs for every call that reached routing.
    fn report(&self, service: &str, method: &Method, success: bool, elapsed: Duration) {
        if let Some(sink) = &self.budget {
            let _ = sink.send(BudgetEvent {
                service: service.to_string(),
                success,
            });
        }
        self.metrics
            .record_request(service, method.as_str(), success, elapsed);
    }

    async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Bytes>,
        headers: HeaderMap,
        least_connections: bool,
    ) -> Result<Bytes> {
        let path = endpoint.split(['?', '#']).next().unwrap_or(endpoint);
        let routed = self.config.service_for(path).to_string();
        let prepared = self
            .target(&routed, least_connections)
            .and_then(|t| join_endpoint(&t.base, endpoint).map(|url| (t, url)));
        let (target, url) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(service = %routed, error = %e, "Request not dispatched");
                self.report(&routed, &method, false, Duration::ZERO);
                return Err(e);
            }
        };
        let service = target.service.as_str();

        let span = self.spans.call(
            method.as_str(),
            service,
            target.base.host_str().unwrap_or_default(),
            url.path(),
        );

        if let Some(health) = self.mesh.as_ref().and_then(|m| m.get_service_status(service)) {
            if health.status != HealthStatus::Healthy {
                warn!(
                    service,
                    status = %health.status,
                    error_rate = health.error_rate,
                    "Service not fully healthy, proceeding anyway"
                );
            }
        }

        let mut request = HttpRequest::new(method.clone(), url).with_headers(headers);
        if let Some(body) = body {
            request = request.with_body(body);
        }
        if let Some(timeout) = self.config.request_timeout() {
            request = request.with_timeout(timeout);
        }

        let guard = target.instance.clone().map(ConnectionGuard::new);
        let breaker = self.breakers.get(service);
        let started = Instant::now();

        let outcome = breaker
            .execute(|| {
                self.retry.execute(|| {
                    let request = request.clone();
                    async move { self.transport.send(request).await?.error_for_status() }
                })
            })
            .instrument(span.span().clone())
            .await;
        let elapsed = started.elapsed();

        self.metrics
            .set_circuit_state(service, breaker.state().as_gauge());

        if let Some(instance) = &target.instance {
            match &outcome {
                Ok(_) => self
                    .balancer
                    .mark_healthy(instance.url(), elapsed.as_secs_f64() * 1000.0),
                Err(e) if e.blames_instance() => self.balancer.mark_unhealthy(instance.url()),
                Err(_) => {}
            }
            self.metrics.set_pool_instances(
                service,
                self.balancer.healthy_count(service) as u64,
                self.balancer.instances(service).len() as u64,
            );
        }
        drop(guard);

        self.report(service, &method, outcome.is_ok(), elapsed);

        match outcome {
            Ok(response) => {
                span.record_status(response.status.as_u16(), elapsed);
                Ok(response.body)
            }
            Err(e) => {
                if e.is_circuit_open() {
                    self.metrics.record_circuit_rejection(service);
                }
                span.record_error(e.status().map(|s| s.as_u16()), &e.to_string());
                Err(e)
            }
        }
    }

    /// Probe every instance currently out of rotation and put back the ones
    /// that answer 2xx. Returns how many were recovered.
    ///
    /// The probe goes to the service's health path on the instance, or the
    /// instance root when the service declares none.
    pub async fn probe_unhealthy_instances(&self) -> usize {
        let timeout = Duration::from_millis(self.config.mesh.probe_timeout_ms);
        let mut recovered = 0;

        for service in self.balancer.services() {
            let health_path = self
                .config
                .services
                .get(service)
                .and_then(|s| s.health_endpoint.as_deref())
                .filter(|p| p.starts_with('/'))
                .unwrap_or("/");

            for instance in self.balancer.unhealthy_instances(service) {
                let Ok(url) = join_endpoint(instance.url(), health_path) else {
                    continue;
                };
                let started = Instant::now();
                let request = HttpRequest::get(url).with_timeout(timeout);
                let healthy = matches!(
                    tokio::time::timeout(timeout, self.transport.send(request)).await,
                    Ok(Ok(response)) if response.is_success()
                );
                if healthy {
                    self.balancer
                        .mark_healthy(instance.url(), started.elapsed().as_secs_f64() * 1000.0);
                    recovered += 1;
                } else {
                    debug!(service, instance = %instance.url(), "Instance still unhealthy");
                }
            }

            self.metrics.set_pool_instances(
                service,
                self.balancer.healthy_count(service) as u64,
                self.balancer.instances(service).len() as u64,
            );
        }
        recovered
    }

    /// Run [`ResilientClient::probe_unhealthy_instances`] every `interval`
    /// until the returned task is aborted.
    pub fn spawn_instance_recovery(&self, interval: Duration) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let recovered = client.probe_unhealthy_instances().await;
                if recovered > 0 {
                    info!(recovered, "Instances returned to rotation");
                }
            }
        })
    }

    /// Start the health mesh, if enabled.
    #[must_use]
    pub fn spawn_mesh(&self) -> Option<MeshHandle> {
        self.mesh.as_ref().map(ServiceMesh::spawn)
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn balancer(&self) -> &InstanceBalancer {
        &self.balancer
    }

    #[must_use]
    pub fn mesh(&self) -> Option<&Arc<ServiceMesh>> {
        self.mesh.as_ref()
    }

    #[must_use]
    pub fn cache(&self) -> &PredictionCache<Value> {
        &self.cache
    }

    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }
}

/// Append `endpoint` to `base`, keeping any path `base` already has.
fn join_endpoint(base: &Url, endpoint: &str) -> Result<Url> {
    let root = base.as_str().trim_end_matches('/');
    let joined = if endpoint.starts_with('/') {
        format!("{root}{endpoint}")
    } else {
        format!("{root}/{endpoint}")
    };
    Ok(Url::parse(&joined)?)
}
