// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client configuration file parser
//!
//! The configuration is a YAML document describing the services the client
//! talks to, how endpoint paths map onto them, and the tunables of every
//! resilience component. Every section is optional; missing sections take
//! the defaults below.
//!
//! ```yaml
//! services:
//!   backend:
//!     instances:
//!       - url: https://api.matchcast.example
//!         weight: 10
//!       - url: https://api-eu.matchcast.example
//!         weight: 5
//!     health_endpoint: /api/backend/health
//!   ml:
//!     base_url: https://ml.matchcast.example
//!     health_endpoint: /api/ml/health
//!     circuit:
//!       failure_threshold: 3
//!       success_threshold: 2
//!       timeout_ms: 60000
//! routes:
//!   - prefix: /api/ml
//!     service: ml
//! retry:
//!   max_attempts: 3
//!   initial_delay_ms: 1000
//! balancer:
//!   all_unhealthy: fallback_to_primary
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{CacheCategoryPolicy, CacheConfig, EvictionPolicy, UPCOMING_MATCH};
use crate::client::{MeshConfig, PoolConfig};
use crate::error::{ClientError, Result};
use crate::runtime::{CircuitBreakerConfig, CircuitBreakerRegistry, ExponentialBackoff, RetryConfig};

/// Path of the configuration file.
pub const ENV_MATCHCAST_CONFIG: &str = "MATCHCAST_CONFIG";
/// Primary backend instance (weight 10).
pub const ENV_BACKEND_URL: &str = "MATCHCAST_BACKEND_URL";
/// First fallback backend instance (weight 5).
pub const ENV_BACKEND_FALLBACK_1: &str = "MATCHCAST_BACKEND_FALLBACK_1";
/// Second fallback backend instance (weight 3).
pub const ENV_BACKEND_FALLBACK_2: &str = "MATCHCAST_BACKEND_FALLBACK_2";
/// Base URL of the ML service.
pub const ENV_ML_URL: &str = "MATCHCAST_ML_URL";

/// Name of the load-balanced primary API.
pub const BACKEND_SERVICE: &str = "backend";
/// Name of the prediction model service.
pub const ML_SERVICE: &str = "ml";
/// Name of the web frontend (health only).
pub const FRONTEND_SERVICE: &str = "frontend";

/// The whole client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Service declarations by name
    pub services: BTreeMap<String, ServiceConfig>,

    /// Path prefixes routed to a service other than `default_service`
    pub routes: Vec<RouteConfig>,

    /// Service for paths no route matches
    pub default_service: String,

    pub retry: RetrySettings,

    /// Cache categories by name
    pub cache: BTreeMap<String, CachePolicySettings>,

    pub mesh: MeshSettings,

    pub balancer: PoolConfig,

    /// Per-attempt transport deadline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,

    /// Base URL relative health endpoints are resolved against
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_base_url: Option<String>,
}

/// A logical service
///
/// A service either has `instances` (load-balanced) or a single `base_url`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub instances: Vec<InstanceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Absolute URL or path under `health_base_url`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,

    /// Overrides the built-in circuit preset for this service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    pub prefix: String,
    pub service: String,
}

/// Retry tunables
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_ms: 1000,
        }
    }
}

impl RetrySettings {
    #[must_use]
    pub fn to_retry_config(&self) -> RetryConfig {
        let backoff = ExponentialBackoff::new(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.backoff_multiplier)
            .with_jitter(Duration::from_millis(self.jitter_ms));
        RetryConfig::builder()
            .max_attempts(self.max_attempts)
            .backoff(backoff)
            .build()
    }
}

/// Circuit breaker tunables
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitSettings {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub timeout_ms: u64,
    #[serde(default = "default_half_open_max")]
    pub half_open_max_requests: usize,
}

fn default_half_open_max() -> usize {
    1
}

impl From<CircuitSettings> for CircuitBreakerConfig {
    fn from(s: CircuitSettings) -> Self {
        CircuitBreakerConfig::new()
            .with_failure_threshold(s.failure_threshold)
            .with_success_threshold(s.success_threshold)
            .with_reset_timeout(Duration::from_millis(s.timeout_ms))
            .with_half_open_max_requests(s.half_open_max_requests)
    }
}

/// One cache category
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachePolicySettings {
    pub ttl_ms: u64,
    pub max_entries: usize,
    pub eviction: EvictionPolicy,
}

impl From<CachePolicySettings> for CacheCategoryPolicy {
    fn from(s: CachePolicySettings) -> Self {
        CacheCategoryPolicy::new(Duration::from_millis(s.ttl_ms), s.max_entries, s.eviction)
    }
}

impl From<&CacheCategoryPolicy> for CachePolicySettings {
    fn from(p: &CacheCategoryPolicy) -> Self {
        Self {
            ttl_ms: p.ttl.as_millis() as u64,
            max_entries: p.max_entries,
            eviction: p.eviction,
        }
    }
}

/// Health mesh tunables
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MeshSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            probe_timeout_ms: 5_000,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let health = |path: &str| ServiceConfig {
            health_endpoint: Some(path.to_string()),
            ..ServiceConfig::default()
        };
        let services = BTreeMap::from([
            (FRONTEND_SERVICE.to_string(), health("/api/health")),
            (BACKEND_SERVICE.to_string(), health("/api/backend/health")),
            (ML_SERVICE.to_string(), health("/api/ml/health")),
        ]);
        let cache = CacheConfig::default()
            .categories
            .iter()
            .map(|(name, policy)| (name.clone(), policy.into()))
            .collect();

        Self {
            services,
            routes: vec![
                RouteConfig {
                    prefix: "/api/ml".to_string(),
                    service: ML_SERVICE.to_string(),
                },
                RouteConfig {
                    prefix: "/ml".to_string(),
                    service: ML_SERVICE.to_string(),
                },
            ],
            default_service: BACKEND_SERVICE.to_string(),
            retry: RetrySettings::default(),
            cache,
            mesh: MeshSettings::default(),
            balancer: PoolConfig::default(),
            request_timeout_ms: None,
            health_base_url: Some("http://localhost:3000".to_string()),
        }
    }
}

impl ClientConfig {
    /// Load configuration from the default location
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined or the
    /// file cannot be read or parsed.
    pub fn load_default() -> Result<Self> {
        Self::load_from_path(Self::config_path()?)
    }

    /// Load the file if it exists (defaults otherwise), then apply the
    /// `MATCHCAST_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_with_env() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed YAML.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ClientError::Config(format!(
                "Failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ClientError::Config(format!("Failed to parse config YAML: {e}")))
    }

    /// Serialize back to YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| ClientError::Config(format!("Failed to serialize config: {e}")))
    }

    /// `<config dir>/matchcast/client.yaml`
    ///
    /// # Errors
    ///
    /// Returns an error if the platform config directory cannot be determined.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            ClientError::Config("Could not determine config directory".to_string())
        })?;
        Ok(dir.join("matchcast").join("client.yaml"))
    }

    /// The config file path, respecting `MATCHCAST_CONFIG`
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is unset and the default path
    /// cannot be determined.
    pub fn config_path() -> Result<PathBuf> {
        match std::env::var(ENV_MATCHCAST_CONFIG) {
            Ok(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Self::default_path(),
        }
    }

    /// Apply instance overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply instance overrides from `lookup`.
    ///
    /// If any backend variable is set, the backend instance list is rebuilt
    /// from the non-empty ones with weights 10, 5 and 3.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend: Vec<InstanceConfig> = [
            (ENV_BACKEND_URL, 10),
            (ENV_BACKEND_FALLBACK_1, 5),
            (ENV_BACKEND_FALLBACK_2, 3),
        ]
        .into_iter()
        .filter_map(|(key, weight)| non_empty(key).map(|url| InstanceConfig { url, weight }))
        .collect();

        if !backend.is_empty() {
            self.services
                .entry(BACKEND_SERVICE.to_string())
                .or_default()
                .instances = backend;
        }

        if let Some(url) = non_empty(ENV_ML_URL) {
            self.services
                .entry(ML_SERVICE.to_string())
                .or_default()
                .base_url = Some(url);
        }
    }

    /// Check the configuration for values the client cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(ClientError::Config("no services declared".to_string()));
        }
        if !self.services.contains_key(&self.default_service) {
            return Err(ClientError::Config(format!(
                "default service '{}' is not declared",
                self.default_service
            )));
        }
        for route in &self.routes {
            if !self.services.contains_key(&route.service) {
                return Err(ClientError::Config(format!(
                    "route '{}' targets undeclared service '{}'",
                    route.prefix, route.service
                )));
            }
        }

        for (name, service) in &self.services {
            for instance in &service.instances {
                if instance.weight == 0 {
                    return Err(ClientError::Config(format!(
                        "instance {} of service '{name}' has zero weight",
                        instance.url
                    )));
                }
                parse_url(&instance.url, name)?;
            }
            if let Some(base) = &service.base_url {
                parse_url(base, name)?;
            }
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(ClientError::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if retry.backoff_multiplier.is_nan() || retry.backoff_multiplier < 1.0 {
            return Err(ClientError::Config(
                "retry backoff_multiplier must be at least 1".to_string(),
            ));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            return Err(ClientError::Config(
                "retry initial_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }

        self.cache_config().validate()?;
        self.circuit_registry().validate()?;

        if self.mesh.enabled {
            self.mesh_config()?;
        }
        Ok(())
    }

    /// The service `path` routes to: longest matching prefix, else the
    /// default service.
    #[must_use]
    pub fn service_for(&self, path: &str) -> &str {
        self.routes
            .iter()
            .filter(|r| path.starts_with(r.prefix.as_str()))
            .max_by_key(|r| r.prefix.len())
            .map_or(self.default_service.as_str(), |r| r.service.as_str())
    }

    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        self.retry.to_retry_config()
    }

    /// Built-in presets plus per-service overrides.
    #[must_use]
    pub fn circuit_registry(&self) -> CircuitBreakerRegistry {
        self.services
            .iter()
            .filter_map(|(name, s)| s.circuit.map(|c| (name, c)))
            .fold(CircuitBreakerRegistry::default(), |registry, (name, c)| {
                registry.with_service_config(name.clone(), c.into())
            })
    }

    /// The cache category table; the default category is `upcoming-match`.
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            categories: self
                .cache
                .iter()
                .map(|(name, settings)| (name.clone(), (*settings).into()))
                .collect(),
            default_category: UPCOMING_MATCH.to_string(),
        }
    }

    /// Mesh services are those with a `health_endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if an endpoint is relative and there is
    /// no usable `health_base_url`.
    pub fn mesh_config(&self) -> Result<MeshConfig> {
        let base = self
            .health_base_url
            .as_deref()
            .map(|b| parse_url(b, "health_base_url"))
            .transpose()?;

        let mut config = MeshConfig::default()
            .with_interval(Duration::from_millis(self.mesh.interval_ms))
            .with_probe_timeout(Duration::from_millis(self.mesh.probe_timeout_ms));

        for (name, service) in &self.services {
            let Some(endpoint) = &service.health_endpoint else {
                continue;
            };
            let url = match (Url::parse(endpoint), &base) {
                (Ok(url), _) => url,
                (Err(_), Some(base)) => base.join(endpoint)?,
                (Err(_), None) => {
                    return Err(ClientError::Config(format!(
                        "health endpoint '{endpoint}' of service '{name}' is relative but no health_base_url is set"
                    )))
                }
            };
            config = config.with_service(name.clone(), url);
        }
        Ok(config)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_url(raw: &str, owner: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| ClientError::Config(format!("invalid URL '{raw}' for {owner}: {e}")))
}
