// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adaptive prediction cache.
//!
//! Entries are grouped into categories, each with its own TTL, capacity and
//! eviction rule (see [`CacheConfig`]). Capacity is enforced on write: when
//! a category is full, exactly one entry chosen by the category's
//! [`EvictionPolicy`] is removed before the new one is inserted, so memory
//! stays bounded by the sum of the category capacities. Expiry is passive:
//! an entry older than its TTL reads as absent and is dropped on that read.
//!
//! # Example
//!
//! ```
//! use matchcast_client::cache::{PredictionCache, SetOptions, LIVE_MATCH};
//!
//! let cache = PredictionCache::default();
//! cache.set("match_42_prediction", 0.61_f64, SetOptions::category(LIVE_MATCH).confidence(0.8));
//! assert_eq!(cache.get("match_42_prediction"), Some(0.61));
//! ```

mod policy;

pub use policy::{
    CacheCategoryPolicy, CacheConfig, EvictionPolicy, HISTORICAL, LIVE_MATCH, UPCOMING_MATCH,
};

use crate::error::{ClientError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Confidence stored when the writer supplies none.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// A cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    /// The resolved category (unknown names map to the default category).
    pub category: String,
    pub confidence: f64,
    pub created_at: Instant,
    pub ttl: Duration,
    /// 1 after the write, plus one per successful read.
    pub access_count: u64,
    pub last_access_at: Instant,
    /// Monotonic access order; breaks `last_access_at` ties.
    pub access_seq: u64,
}

impl<T> CacheEntry<T> {
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// Write options for [`PredictionCache::set`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    pub category: Option<String>,
    pub confidence: Option<f64>,
}

impl SetOptions {
    #[must_use]
    pub fn category(name: impl Into<String>) -> Self {
        Self {
            category: Some(name.into()),
            confidence: None,
        }
    }

    #[must_use]
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub per_category: BTreeMap<String, usize>,
    pub avg_access_count: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct Inner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    by_category: HashMap<String, HashSet<String>>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<T> Inner<T> {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        if let Some(keys) = self.by_category.get_mut(&entry.category) {
            keys.remove(key);
        }
        Some(entry)
    }

    fn select_victim(&self, category: &str, policy: EvictionPolicy) -> Option<String> {
        let candidates = self
            .by_category
            .get(category)?
            .iter()
            .filter_map(|k| self.entries.get(k).map(|e| (k, e)));

        let victim = match policy {
            EvictionPolicy::Lru => candidates.min_by_key(|(_, e)| e.access_seq),
            EvictionPolicy::Lfu => candidates.min_by_key(|(_, e)| (e.access_count, e.access_seq)),
            EvictionPolicy::Confidence => candidates.min_by(|(_, a), (_, b)| {
                a.confidence
                    .total_cmp(&b.confidence)
                    .then(a.access_seq.cmp(&b.access_seq))
            }),
        };
        victim.map(|(k, _)| k.clone())
    }

    /// Read path: expiry check, then access bookkeeping.
    fn touch(&mut self, key: &str) -> Option<&CacheEntry<T>> {
        let now = Instant::now();
        let expired = self.entries.get(key).map(|e| e.is_expired(now));
        match expired {
            None => {
                self.misses += 1;
                return None;
            }
            Some(true) => {
                self.remove(key);
                self.misses += 1;
                return None;
            }
            Some(false) => {}
        }

        let seq = self.seq();
        self.hits += 1;
        let entry = self.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access_at = now;
        entry.access_seq = seq;
        Some(&*entry)
    }
}

/// Keyed store with per-category TTL, capacity and eviction.
#[derive(Debug)]
pub struct PredictionCache<T> {
    config: CacheConfig,
    inner: Mutex<Inner<T>>,
}

impl<T> Default for PredictionCache<T> {
    fn default() -> Self {
        Self::with_valid_config(CacheConfig::default())
    }
}

impl<T> PredictionCache<T> {
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the category table is invalid.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                by_category: HashMap::new(),
                next_seq: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Insert or replace `key`.
    ///
    /// If the category is full and `key` is not already in it, one entry is
    /// evicted first. The new entry starts with an access count of 1.
    pub fn set(&self, key: impl Into<String>, value: T, options: SetOptions) {
        let key = key.into();
        let requested = options.category.as_deref().unwrap_or(&self.config.default_category);
        let Some((category, policy)) = self.config.resolve(requested) else {
            return;
        };
        let confidence = match options.confidence {
            Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
            _ => DEFAULT_CONFIDENCE,
        };

        let mut inner = self.lock();
        let now = Instant::now();

        // Replacing a key in place never evicts.
        inner.remove(&key);

        let occupied = inner.by_category.get(category).map_or(0, HashSet::len);
        if occupied >= policy.max_entries {
            if let Some(victim) = inner.select_victim(category, policy.eviction) {
                inner.remove(&victim);
                inner.evictions += 1;
                debug!(category, key = %victim, policy = ?policy.eviction, "Evicted cache entry");
            }
        }

        let seq = inner.seq();
        inner
            .by_category
            .entry(category.to_string())
            .or_default()
            .insert(key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                category: category.to_string(),
                confidence,
                created_at: now,
                ttl: policy.ttl,
                access_count: 1,
                last_access_at: now,
                access_seq: seq,
            },
        );
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &str) -> Option<T> {
        self.lock().remove(key).map(|e| e.value)
    }

    /// Remove every key matching a glob such as `match_12345_*`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Validation` for a malformed pattern.
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let glob = glob::Pattern::new(pattern)
            .map_err(|e| ClientError::Validation(format!("invalid cache pattern '{pattern}': {e}")))?;

        let mut inner = self.lock();
        let doomed: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| glob.matches(k))
            .cloned()
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        debug!(pattern, removed = doomed.len(), "Invalidated cache entries");
        Ok(doomed.len())
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.by_category.clear();
    }

    /// Stored entries, expired ones included until they are read or evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let total = inner.entries.len();
        let accesses: u64 = inner.entries.values().map(|e| e.access_count).sum();
        CacheStats {
            total_entries: total,
            per_category: inner
                .by_category
                .iter()
                .map(|(c, keys)| (c.clone(), keys.len()))
                .collect(),
            avg_access_count: if total == 0 {
                0.0
            } else {
                accesses as f64 / total as f64
            },
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

impl<T: Clone> PredictionCache<T> {
    /// The value under `key`, unless absent or expired.
    pub fn get(&self, key: &str) -> Option<T> {
        self.lock().touch(key).map(|e| e.value.clone())
    }

    /// Like [`get`](Self::get), with the entry's bookkeeping.
    pub fn get_with_metadata(&self, key: &str) -> Option<CacheEntry<T>> {
        self.lock().touch(key).cloned()
    }
}
