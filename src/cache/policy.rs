// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-category cache policies.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Category for in-play predictions.
pub const LIVE_MATCH: &str = "live-match";
/// Category for matches not yet started. Also the fallback category.
pub const UPCOMING_MATCH: &str = "upcoming-match";
/// Category for finished matches and statistics.
pub const HISTORICAL: &str = "historical";

/// Which entry leaves a full category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Least recently read or written.
    #[serde(rename = "lru")]
    Lru,
    /// Fewest reads since it was written.
    #[serde(rename = "lfu")]
    Lfu,
    /// Lowest stored confidence.
    #[serde(rename = "confidence-based", alias = "confidence")]
    Confidence,
}

/// TTL, capacity and eviction rule for one category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheCategoryPolicy {
    pub ttl: Duration,
    pub max_entries: usize,
    pub eviction: EvictionPolicy,
}

impl CacheCategoryPolicy {
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize, eviction: EvictionPolicy) -> Self {
        Self {
            ttl,
            max_entries,
            eviction,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// # Errors
    ///
    /// Returns `ClientError::Config` for a zero TTL or capacity.
    pub fn validate(&self, category: &str) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(ClientError::Config(format!(
                "cache category '{category}' has a zero TTL"
            )));
        }
        if self.max_entries == 0 {
            return Err(ClientError::Config(format!(
                "cache category '{category}' has zero capacity"
            )));
        }
        Ok(())
    }
}

/// The category table and the category used for unknown names.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub categories: BTreeMap<String, CacheCategoryPolicy>,
    pub default_category: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let categories = BTreeMap::from([
            (
                LIVE_MATCH.to_string(),
                CacheCategoryPolicy::new(Duration::from_secs(30), 50, EvictionPolicy::Lru),
            ),
            (
                UPCOMING_MATCH.to_string(),
                CacheCategoryPolicy::new(
                    Duration::from_secs(5 * 60),
                    200,
                    EvictionPolicy::Confidence,
                ),
            ),
            (
                HISTORICAL.to_string(),
                CacheCategoryPolicy::new(Duration::from_secs(60 * 60), 1000, EvictionPolicy::Lfu),
            ),
        ]);
        Self {
            categories,
            default_category: UPCOMING_MATCH.to_string(),
        }
    }
}

impl CacheConfig {
    /// Add or replace a category.
    #[must_use]
    pub fn with_category(mut self, name: impl Into<String>, policy: CacheCategoryPolicy) -> Self {
        self.categories.insert(name.into(), policy);
        self
    }

    /// Resolve `category` to a known name and its policy.
    pub(crate) fn resolve<'a>(&'a self, category: &'a str) -> Option<(&'a str, &'a CacheCategoryPolicy)> {
        self.categories
            .get_key_value(category)
            .or_else(|| self.categories.get_key_value(self.default_category.as_str()))
            .map(|(name, policy)| (name.as_str(), policy))
    }

    /// # Errors
    ///
    /// Returns `ClientError::Config` if the default category is missing or
    /// any policy is invalid.
    pub fn validate(&self) -> Result<()> {
        if !self.categories.contains_key(&self.default_category) {
            return Err(ClientError::Config(format!(
                "default cache category '{}' is not defined",
                self.default_category
            )));
        }
        for (name, policy) in &self.categories {
            policy.validate(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());

        let live = config.categories[LIVE_MATCH];
        assert_eq!(live.ttl, Duration::from_secs(30));
        assert_eq!(live.max_entries, 50);
        assert_eq!(live.eviction, EvictionPolicy::Lru);

        assert_eq!(
            config.categories[UPCOMING_MATCH].eviction,
            EvictionPolicy::Confidence
        );
        assert_eq!(config.categories[HISTORICAL].max_entries, 1000);
    }

    #[test]
    fn test_unknown_category_resolves_to_default() {
        let config = CacheConfig::default();
        let (name, policy) = config.resolve("news").unwrap();
        assert_eq!(name, UPCOMING_MATCH);
        assert_eq!(policy.max_entries, 200);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = CacheConfig::default().with_category(
            "odds",
            CacheCategoryPolicy::new(Duration::from_secs(1), 0, EvictionPolicy::Lru),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_eviction_policy_names() {
        let p: EvictionPolicy = serde_yaml::from_str("confidence-based").unwrap();
        assert_eq!(p, EvictionPolicy::Confidence);
        let p: EvictionPolicy = serde_yaml::from_str("lfu").unwrap();
        assert_eq!(p, EvictionPolicy::Lfu);
    }
}
