// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resilient HTTP client for the MatchCast backend and ML services.
//!
//! ```no_run
//! use matchcast_client::{ClientConfig, RequestOptions, ResilientClient};
//! use serde_json::Value;
//!
//! # async fn example() -> matchcast_client::Result<()> {
//! let client = ResilientClient::new(ClientConfig::load_with_env()?)?;
//! let _mesh = client.spawn_mesh();
//!
//! let matches: Value = client.get("/api/matches", RequestOptions::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod runtime;
pub mod testkit;
pub mod transport;

pub use cache::{CacheConfig, PredictionCache, SetOptions};
pub use client::{CacheDirective, RequestOptions, ResilientClient, ResilientClientBuilder};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
