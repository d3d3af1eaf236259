// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration management for the MatchCast client
//!
//! The client is configured from a YAML file and a handful of environment
//! variables that override the instance lists.
//!
//! # Environment Variables
//!
//! - `MATCHCAST_CONFIG` - Path to the config file (default: `<config dir>/matchcast/client.yaml`)
//! - `MATCHCAST_BACKEND_URL` - Primary backend instance, weight 10
//! - `MATCHCAST_BACKEND_FALLBACK_1` - Fallback backend instance, weight 5
//! - `MATCHCAST_BACKEND_FALLBACK_2` - Fallback backend instance, weight 3
//! - `MATCHCAST_ML_URL` - Base URL of the ML service
//!
//! Empty values are ignored.
//!
//! # Example
//!
//! ```no_run
//! use matchcast_client::config::ClientConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::load_with_env()?;
//! config.validate()?;
//!
//! for (name, service) in &config.services {
//!     println!("{name}: {} instance(s)", service.instances.len());
//! }
//! # Ok(())
//! # }
//! ```

mod client_config;

pub use client_config::{
    CachePolicySettings, CircuitSettings, ClientConfig, InstanceConfig, MeshSettings,
    RetrySettings, RouteConfig, ServiceConfig, BACKEND_SERVICE, ENV_BACKEND_FALLBACK_1,
    ENV_BACKEND_FALLBACK_2, ENV_BACKEND_URL, ENV_MATCHCAST_CONFIG, ENV_ML_URL, FRONTEND_SERVICE,
    ML_SERVICE,
};
