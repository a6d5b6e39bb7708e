//! Provider response cache
//!
//! Entries are keyed by (query, provider, field-or-"*") and are immutable:
//! a refresh replaces the `Arc<CacheEntry>`, it never mutates one. The map is
//! sharded (`dashmap`), so lookups for different keys do not contend.
//!
//! Expired entries are kept for a grace period so the merger can serve them
//! stale while a background refresh runs, when stale-while-revalidate is on.

use crate::types::WHOLE_PAYLOAD;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Cache key: (query, provider, field or `"*"`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub query: String,
    pub provider: String,
    pub field: String,
}

impl CacheKey {
    pub fn new(query: impl Into<String>, provider: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            provider: provider.into(),
            field: field.into(),
        }
    }

    /// Key for a provider's whole payload
    pub fn whole(query: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::new(query, provider, WHOLE_PAYLOAD)
    }
}

/// Immutable cached value
#[derive(Debug)]
pub struct CacheEntry {
    pub value: Value,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Within TTL
    Fresh { value: Value, age: Duration },
    /// Past TTL but inside the stale grace period
    Stale { value: Value, age: Duration },
    Miss,
}

/// Sharded response cache
#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    refreshing: DashSet<CacheKey>,
    stale_grace: Duration,
}

impl ResponseCache {
    pub fn new(stale_grace: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            refreshing: DashSet::new(),
            stale_grace,
        }
    }

    /// Fresh value and its age, if present and within TTL
    pub fn get(&self, key: &CacheKey) -> Option<(Value, Duration)> {
        match self.lookup(key) {
            CacheLookup::Fresh { value, age } => Some((value, age)),
            _ => None,
        }
    }

    /// Classify the entry for `key` as fresh, stale or missing
    ///
    /// Entries past TTL plus grace are dropped on the way out.
    pub fn lookup(&self, key: &CacheKey) -> CacheLookup {
        let Some(entry) = self.entries.get(key).map(|e| Arc::clone(e.value())) else {
            return CacheLookup::Miss;
        };

        let age = entry.age();
        if age < entry.ttl {
            return CacheLookup::Fresh {
                value: entry.value.clone(),
                age,
            };
        }

        if age < entry.ttl + self.stale_grace {
            return CacheLookup::Stale {
                value: entry.value.clone(),
                age,
            };
        }

        // Only remove the exact entry we inspected; a concurrent refresh may
        // already have replaced it.
        self.entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, &entry));
        CacheLookup::Miss
    }

    /// Insert or replace an entry
    pub fn put(&self, key: CacheKey, value: Value, ttl: Duration) {
        let entry = Arc::new(CacheEntry {
            value,
            fetched_at: Instant::now(),
            ttl,
        });
        self.entries.insert(key, entry);
    }

    /// Remove every entry for a query; returns how many were removed
    pub fn invalidate(&self, query: &str) -> usize {
        self.remove_matching(|key| key.query == query)
    }

    /// Remove every entry produced by a provider
    pub fn invalidate_provider(&self, provider: &str) -> usize {
        self.remove_matching(|key| key.provider == provider)
    }

    /// Drop entries past TTL plus grace
    pub fn purge_expired(&self) -> usize {
        let grace = self.stale_grace;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.age() < entry.ttl + grace);
        before.saturating_sub(self.entries.len())
    }

    fn remove_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheKey) -> bool,
    {
        let keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| predicate(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let removed = keys
            .iter()
            .filter(|key| self.entries.remove(*key).is_some())
            .count();

        if removed > 0 {
            debug!(removed, "Cache entries invalidated");
        }
        removed
    }

    /// Claim the background refresh for `key`
    ///
    /// Returns false when another task is already refreshing it.
    pub fn begin_refresh(&self, key: &CacheKey) -> bool {
        self.refreshing.insert(key.clone())
    }

    pub fn end_refresh(&self, key: &CacheKey) {
        self.refreshing.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
