// SPDX-License-Identifier: MIT OR Apache-2.0

//! Instance pools and load balancing for multi-instance services.
//!
//! This module provides:
//! - [`BackendInstance`]: One base URL of a service with lock-free health,
//!   latency and connection bookkeeping
//! - [`InstanceBalancer`]: Per-service pools with weighted round-robin and
//!   least-connections selection
//! - [`ConnectionGuard`]: Scoped connection accounting
//!
//! An instance only leaves weighted selection through
//! [`InstanceBalancer::mark_unhealthy`] and only comes back through
//! [`InstanceBalancer::mark_healthy`]; nothing re-includes it automatically.
//!
//! # Example
//!
//! ```
//! use matchcast_client::client::{InstanceBalancer, PoolConfig};
//!
//! let mut balancer = InstanceBalancer::new(PoolConfig::default());
//! balancer.add_instance("backend", "http://primary:3001", 10)?;
//! balancer.add_instance("backend", "http://fallback:3001", 5)?;
//!
//! let instance = balancer.select_instance("backend").unwrap();
//! assert_eq!(instance.url().as_str(), "http://primary:3001/");
//! # Ok::<(), matchcast_client::ClientError>(())
//! ```

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

/// One addressable instance of a logical service.
#[derive(Debug)]
pub struct BackendInstance {
    url: Url,
    weight: u32,
    healthy: AtomicBool,
    active_connections: AtomicUsize,
    /// f64 bits of the last observed response time in milliseconds.
    response_time_ms: AtomicU64,
    unhealthy_since: Mutex<Option<Instant>>,
}

impl BackendInstance {
    /// A healthy instance with no connections.
    #[must_use]
    pub fn new(url: Url, weight: u32) -> Self {
        Self {
            url,
            weight,
            healthy: AtomicBool::new(true),
            active_connections: AtomicUsize::new(0),
            response_time_ms: AtomicU64::new(0f64.to_bits()),
            unhealthy_since: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Last response time recorded by a successful call.
    #[must_use]
    pub fn response_time_ms(&self) -> f64 {
        f64::from_bits(self.response_time_ms.load(Ordering::Relaxed))
    }

    /// When the instance was last taken out of rotation, if it still is.
    #[must_use]
    pub fn unhealthy_since(&self) -> Option<Instant> {
        *self
            .unhealthy_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether the instance was unhealthy before.
    fn set_healthy(&self, response_time_ms: f64) -> bool {
        self.response_time_ms
            .store(response_time_ms.to_bits(), Ordering::Relaxed);
        *self
            .unhealthy_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        !self.healthy.swap(true, Ordering::AcqRel)
    }

    /// Returns whether the instance was healthy before.
    fn set_unhealthy(&self) -> bool {
        let was_healthy = self.healthy.swap(false, Ordering::AcqRel);
        if was_healthy {
            *self
                .unhealthy_since
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        }
        was_healthy
    }

    fn increment(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement(&self) {
        // Never below zero, even for an unmatched decrement.
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Holds one connection slot on an instance; released on drop.
#[derive(Debug)]
#[must_use = "the connection is released as soon as the guard is dropped"]
pub struct ConnectionGuard {
    instance: Arc<BackendInstance>,
}

impl ConnectionGuard {
    pub fn new(instance: Arc<BackendInstance>) -> Self {
        instance.increment();
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<BackendInstance> {
        &self.instance
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.instance.decrement();
    }
}

/// What `select_instance` does when every instance is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllUnhealthyPolicy {
    /// Route to the first configured instance anyway.
    #[default]
    FallbackToPrimary,
    /// Return no instance; the caller fails with `NoInstance`.
    FailFast,
}

/// Configuration for the instance balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub all_unhealthy: AllUnhealthyPolicy,
}

impl PoolConfig {
    #[must_use]
    pub fn with_all_unhealthy(mut self, policy: AllUnhealthyPolicy) -> Self {
        self.all_unhealthy = policy;
        self
    }
}

/// Per-instance view returned by [`InstanceBalancer::stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStats {
    pub url: String,
    pub healthy: bool,
    pub connections: usize,
    pub avg_response_time_ms: f64,
}

/// The instances of one logical service, primary first.
#[derive(Debug, Default)]
struct ServicePool {
    instances: Vec<Arc<BackendInstance>>,
    round_robin_index: AtomicUsize,
}

impl ServicePool {
    fn healthy(&self) -> Vec<&Arc<BackendInstance>> {
        self.instances.iter().filter(|i| i.is_healthy()).collect()
    }
}

/// Load balancer over per-service instance pools.
///
/// Pools are fixed after construction; only per-instance health, latency
/// and connection counts change at runtime.
#[derive(Debug, Default)]
pub struct InstanceBalancer {
    config: PoolConfig,
    pools: BTreeMap<String, ServicePool>,
}

impl InstanceBalancer {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: BTreeMap::new(),
        }
    }

    /// Build pools for every service that declares instances.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` for an unparseable URL or zero weight.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let mut balancer = Self::new(config.balancer);
        for (service, declared) in &config.services {
            for instance in &declared.instances {
                balancer.add_instance(service, &instance.url, instance.weight)?;
            }
        }
        Ok(balancer)
    }

    /// Append an instance to `service`'s pool. An empty URL is skipped.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` for an unparseable URL or zero weight.
    pub fn add_instance(&mut self, service: &str, url: &str, weight: u32) -> Result<()> {
        if url.trim().is_empty() {
            debug!(service, "Skipping instance with empty URL");
            return Ok(());
        }
        if weight == 0 {
            return Err(ClientError::Config(format!(
                "instance {url} of service '{service}' has zero weight"
            )));
        }
        let url = Url::parse(url)?;
        self.pools
            .entry(service.to_string())
            .or_default()
            .instances
            .push(Arc::new(BackendInstance::new(url, weight)));
        Ok(())
    }

    /// Whether `service` is load-balanced at all.
    #[must_use]
    pub fn has_service(&self, service: &str) -> bool {
        self.pools.contains_key(service)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    /// All instances of `service`, primary first.
    #[must_use]
    pub fn instances(&self, service: &str) -> &[Arc<BackendInstance>] {
        self.pools
            .get(service)
            .map(|p| p.instances.as_slice())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Weighted round-robin over the healthy instances of `service`.
    ///
    /// With no healthy instance, the result depends on
    /// [`PoolConfig::all_unhealthy`].
    #[must_use]
    pub fn select_instance(&self, service: &str) -> Option<Arc<BackendInstance>> {
        let pool = self.pools.get(service)?;
        let healthy = pool.healthy();

        match healthy.len() {
            0 => {
                error!(service, "No healthy instances available");
                match self.config.all_unhealthy {
                    AllUnhealthyPolicy::FallbackToPrimary => pool.instances.first().cloned(),
                    AllUnhealthyPolicy::FailFast => None,
                }
            }
            1 => Some(healthy[0].clone()),
            _ => {
                let total_weight: usize = healthy.iter().map(|i| i.weight as usize).sum();
                let mut selection =
                    pool.round_robin_index.fetch_add(1, Ordering::Relaxed) % total_weight;
                for instance in &healthy {
                    let weight = instance.weight as usize;
                    if selection < weight {
                        return Some((*instance).clone());
                    }
                    selection -= weight;
                }
                Some(healthy[0].clone())
            }
        }
    }

    /// The healthy instance of `service` with the fewest active connections.
    ///
    /// Ties go to the instance configured first.
    #[must_use]
    pub fn select_least_connections(&self, service: &str) -> Option<Arc<BackendInstance>> {
        self.pools
            .get(service)?
            .healthy()
            .into_iter()
            .min_by_key(|i| i.active_connections())
            .cloned()
    }

    fn matching<'a>(&'a self, url: &'a Url) -> impl Iterator<Item = &'a Arc<BackendInstance>> {
        self.pools
            .values()
            .flat_map(|p| p.instances.iter())
            .filter(move |i| i.url() == url)
    }

    /// Put every instance at `url` (back) into rotation and record latency.
    pub fn mark_healthy(&self, url: &Url, response_time_ms: f64) {
        for instance in self.matching(url) {
            if instance.set_healthy(response_time_ms) {
                info!(instance = %url, "Instance healthy again");
            }
        }
    }

    /// Take every instance at `url` out of weighted rotation.
    pub fn mark_unhealthy(&self, url: &Url) {
        for instance in self.matching(url) {
            if instance.set_unhealthy() {
                warn!(instance = %url, "Marked instance unhealthy");
            }
        }
    }

    pub fn increment_connections(&self, url: &Url) {
        for instance in self.matching(url) {
            instance.increment();
        }
    }

    /// Decrement, saturating at zero.
    pub fn decrement_connections(&self, url: &Url) {
        for instance in self.matching(url) {
            instance.decrement();
        }
    }

    /// Instances of `service` currently out of rotation.
    #[must_use]
    pub fn unhealthy_instances(&self, service: &str) -> Vec<Arc<BackendInstance>> {
        self.instances(service)
            .iter()
            .filter(|i| !i.is_healthy())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn healthy_count(&self, service: &str) -> usize {
        self.instances(service)
            .iter()
            .filter(|i| i.is_healthy())
            .count()
    }

    #[must_use]
    pub fn stats(&self, service: &str) -> Vec<InstanceStats> {
        self.instances(service)
            .iter()
            .map(|i| InstanceStats {
                url: i.url().to_string(),
                healthy: i.is_healthy(),
                connections: i.active_connections(),
                avg_response_time_ms: i.response_time_ms(),
            })
            .collect()
    }
}
