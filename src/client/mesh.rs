// SPDX-License-Identifier: MIT OR Apache-2.0

//! Health mesh: periodic probing of the services the client depends on.
//!
//! Each registered service has a health endpoint. A probe round issues one
//! bounded-timeout GET per service and folds the outcome into a rolling
//! [`ServiceHealth`]:
//!
//! | Outcome | Status | Error rate |
//! |---------|--------|------------|
//! | 2xx | `Healthy` | `rate * 0.9` |
//! | other status | `Degraded` | `min(rate + 0.1, 1)` |
//! | no response or timeout | `Down` | `min(rate + 0.2, 1)` |
//!
//! The mesh is advisory. [`ServiceMesh::can_serve_request`] only says no when
//! a required service is `Down`; the client logs and proceeds regardless.
//!
//! # Example
//!
//! ```no_run
//! use matchcast_client::client::{MeshConfig, ServiceMesh};
//! use matchcast_client::transport::ReqwestTransport;
//! use std::sync::Arc;
//! use url::Url;
//!
//! # async fn example() -> matchcast_client::Result<()> {
//! let base = Url::parse("http://localhost:3000")?;
//! let config = MeshConfig::with_default_services(&base)?;
//! let transport = Arc::new(ReqwestTransport::new(None)?);
//!
//! let mesh = Arc::new(ServiceMesh::new(config, transport));
//! let handle = mesh.spawn();
//!
//! if !mesh.can_serve_request(&["backend", "ml"]) {
//!     eprintln!("a required service is down");
//! }
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::transport::{HttpRequest, Transport};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

/// Health of one service as seen by the last probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Responding, but not with 2xx.
    Degraded,
    /// Not responding.
    Down,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Rolling health record for one service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHealth {
    pub name: String,
    pub endpoint: Url,
    pub status: HealthStatus,
    pub response_time_ms: f64,
    /// In `[0, 1]`.
    pub error_rate: f64,
    pub last_check_at: Instant,
}

impl ServiceHealth {
    fn new(name: String, endpoint: Url) -> Self {
        Self {
            name,
            endpoint,
            status: HealthStatus::Healthy,
            response_time_ms: 0.0,
            error_rate: 0.0,
            last_check_at: Instant::now(),
        }
    }

    fn record(&mut self, outcome: ProbeOutcome, elapsed: Duration) {
        match outcome {
            ProbeOutcome::Ok => {
                self.status = HealthStatus::Healthy;
                self.response_time_ms = elapsed.as_secs_f64() * 1000.0;
                self.error_rate *= 0.9;
            }
            ProbeOutcome::BadStatus => {
                self.status = HealthStatus::Degraded;
                self.response_time_ms = elapsed.as_secs_f64() * 1000.0;
                self.error_rate = (self.error_rate + 0.1).min(1.0);
            }
            ProbeOutcome::NoResponse => {
                self.status = HealthStatus::Down;
                self.error_rate = (self.error_rate + 0.2).min(1.0);
            }
        }
        self.last_check_at = Instant::now();
    }
}

#[derive(Debug, Clone, Copy)]
enum ProbeOutcome {
    Ok,
    BadStatus,
    NoResponse,
}

/// A service to monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshService {
    pub name: String,
    pub endpoint: Url,
}

/// Configuration for the health mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Time between probe rounds.
    pub interval: Duration,
    /// Deadline for a single probe.
    pub probe_timeout: Duration,
    pub services: Vec<MeshService>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            services: Vec::new(),
        }
    }
}

impl MeshConfig {
    /// `frontend`, `backend` and `ml` with their health paths under `base`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if a path cannot be joined onto `base`.
    pub fn with_default_services(base: &Url) -> Result<Self> {
        let mut config = Self::default();
        for (name, path) in [
            ("frontend", "/api/health"),
            ("backend", "/api/backend/health"),
            ("ml", "/api/ml/health"),
        ] {
            config = config.with_service(name, base.join(path)?);
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_service(mut self, name: impl Into<String>, endpoint: Url) -> Self {
        self.services.push(MeshService {
            name: name.into(),
            endpoint,
        });
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

/// Tracks the health of a fixed set of services.
#[derive(Debug)]
pub struct ServiceMesh {
    config: MeshConfig,
    transport: Arc<dyn Transport>,
    services: Mutex<BTreeMap<String, ServiceHealth>>,
}

impl ServiceMesh {
    /// Register every configured service as healthy with a zero error rate.
    pub fn new(config: MeshConfig, transport: Arc<dyn Transport>) -> Self {
        let services = config
            .services
            .iter()
            .map(|s| (s.name.clone(), ServiceHealth::new(s.name.clone(), s.endpoint.clone())))
            .collect();
        Self {
            config,
            transport,
            services: Mutex::new(services),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ServiceHealth>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Probe one service now. Returns `None` for an unregistered name.
    pub async fn check_service(&self, name: &str) -> Option<HealthStatus> {
        let endpoint = self.lock().get(name)?.endpoint.clone();
        let timeout = self.config.probe_timeout;
        let request = HttpRequest::get(endpoint.clone()).with_timeout(timeout);

        let start = Instant::now();
        let outcome = match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(Ok(response)) if response.is_success() => ProbeOutcome::Ok,
            Ok(Ok(response)) => {
                warn!(service = name, endpoint = %endpoint, status = %response.status, "Health check failed: non-success status");
                ProbeOutcome::BadStatus
            }
            Ok(Err(e)) => {
                warn!(service = name, endpoint = %endpoint, error = %e, "Health check failed: no response");
                ProbeOutcome::NoResponse
            }
            Err(_) => {
                warn!(service = name, endpoint = %endpoint, "Health check failed: timeout");
                ProbeOutcome::NoResponse
            }
        };
        let elapsed = start.elapsed();

        let mut services = self.lock();
        let health = services.get_mut(name)?;
        health.record(outcome, elapsed);
        debug!(
            service = name,
            status = %health.status,
            error_rate = health.error_rate,
            "Health check complete"
        );
        Some(health.status)
    }

    /// One probe round over every registered service.
    pub async fn check_all(&self) {
        let names: Vec<String> = self.lock().keys().cloned().collect();
        for name in names {
            self.check_service(&name).await;
        }
    }

    /// Run probe rounds every `interval` until the handle is shut down or
    /// dropped. The first round starts one interval from now.
    pub fn spawn(self: &Arc<Self>) -> MeshHandle {
        let (shutdown, mut stop) = oneshot::channel::<()>();
        let mesh = Arc::clone(self);
        let period = mesh.config.interval;

        let task = tokio::spawn(async move {
            info!(
                interval_ms = period.as_millis() as u64,
                services = mesh.config.services.len(),
                "Health mesh starting"
            );
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => mesh.check_all().await,
                    _ = &mut stop => {
                        info!("Health mesh stopping");
                        break;
                    }
                }
            }
        });

        MeshHandle { shutdown, task }
    }

    /// `true` only when the last probe of `name` succeeded.
    #[must_use]
    pub fn is_healthy(&self, name: &str) -> bool {
        self.lock()
            .get(name)
            .is_some_and(|s| s.status == HealthStatus::Healthy)
    }

    #[must_use]
    pub fn get_service_status(&self, name: &str) -> Option<ServiceHealth> {
        self.lock().get(name).cloned()
    }

    #[must_use]
    pub fn all_services(&self) -> Vec<ServiceHealth> {
        self.lock().values().cloned().collect()
    }

    /// `false` if any of `required` is down. Degraded and unknown services
    /// do not block.
    #[must_use]
    pub fn can_serve_request(&self, required: &[&str]) -> bool {
        let services = self.lock();
        !required
            .iter()
            .any(|name| services.get(*name).is_some_and(|s| s.status == HealthStatus::Down))
    }
}

/// Owns the background probe task. Dropping it stops the task too.
#[derive(Debug)]
pub struct MeshHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MeshHandle {
    /// Stop probing and wait for an in-flight round to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{MockReply, MockTransport};

    const BACKEND: &str = "http://mesh.test/api/backend/health";

    fn mesh(mock: &Arc<MockTransport>) -> Arc<ServiceMesh> {
        let base = Url::parse("http://mesh.test").unwrap();
        let config = MeshConfig::with_default_services(&base).unwrap();
        Arc::new(ServiceMesh::new(config, mock.clone()))
    }

    fn rate(mesh: &ServiceMesh, name: &str) -> f64 {
        mesh.get_service_status(name).unwrap().error_rate
    }

    #[test]
    fn test_services_start_healthy() {
        let mock = Arc::new(MockTransport::new());
        let mesh = mesh(&mock);

        let names: Vec<_> = mesh.all_services().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["backend", "frontend", "ml"]);
        assert!(mesh.is_healthy("backend"));
        assert_eq!(rate(&mesh, "backend"), 0.0);
        assert!(mesh.get_service_status("payments").is_none());
        assert!(!mesh.is_healthy("payments"));
    }

    #[tokio::test]
    async fn test_probe_outcomes_update_error_rate() {
        let mock = Arc::new(MockTransport::new());
        mock.push(BACKEND, MockReply::network_error())
            .push(BACKEND, MockReply::status(503))
            .push(BACKEND, MockReply::status(200));
        let mesh = mesh(&mock);

        assert_eq!(mesh.check_service("backend").await, Some(HealthStatus::Down));
        assert!((rate(&mesh, "backend") - 0.2).abs() < 1e-9);

        assert_eq!(
            mesh.check_service("backend").await,
            Some(HealthStatus::Degraded)
        );
        assert!((rate(&mesh, "backend") - 0.3).abs() < 1e-9);

        assert_eq!(
            mesh.check_service("backend").await,
            Some(HealthStatus::Healthy)
        );
        assert!((rate(&mesh, "backend") - 0.27).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_error_rate_saturates_at_one() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(BACKEND, MockReply::network_error());
        let mesh = mesh(&mock);

        for _ in 0..8 {
            mesh.check_service("backend").await;
        }
        assert_eq!(rate(&mesh, "backend"), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_counts_as_down() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            BACKEND,
            MockReply::status(200).delayed(Duration::from_secs(6)),
        );
        let mesh = mesh(&mock);

        assert_eq!(mesh.check_service("backend").await, Some(HealthStatus::Down));
    }

    #[tokio::test]
    async fn test_can_serve_request_tolerates_degraded() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(BACKEND, MockReply::status(500))
            .respond("http://mesh.test/api/ml/health", MockReply::network_error());
        let mesh = mesh(&mock);

        mesh.check_service("backend").await;
        assert!(!mesh.is_healthy("backend"));
        assert!(mesh.can_serve_request(&["backend"]));

        mesh.check_service("ml").await;
        assert!(!mesh.can_serve_request(&["backend", "ml"]));
        assert!(mesh.can_serve_request(&["frontend", "unknown"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_rounds_stop_on_shutdown() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(BACKEND, MockReply::status(200));
        let mesh = mesh(&mock);

        let handle = mesh.spawn();
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(mock.call_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mock.call_count(), 3);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(mock.call_count(), 3);
    }
}
