//! Local Cache
//!
//! Process-local, bounded, TTL-aware key/value store. Reads served from here
//! never touch the upstream backend, so they survive a total outage at the
//! cost of staleness.
//!
//! # Eviction
//!
//! Entries are ordered by position. A `get` hit moves the entry to the newest
//! position; `set` on an existing key keeps its position. When a new key is
//! inserted at capacity, the entry in the oldest position is evicted. This is
//! an approximate LRU ("oldest inserted or untouched"), not strict recency.
//!
//! # Expiry
//!
//! TTLs are checked in epoch milliseconds at read time. There is no
//! background sweep: an expired entry may stay in storage until it is read,
//! evicted or deleted, but it is never served.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::clock::{SharedClock, duration_millis, system_clock};
use crate::infrastructure::metrics;

/// Default number of entries.
pub const DEFAULT_CAPACITY: usize = 1_000;

/// Local cache configuration.
#[derive(Debug, Clone, Copy)]
pub struct LocalCacheConfig {
    /// Maximum number of entries enforced by `set`.
    pub capacity: usize,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: String,
    expires_at_ms: Option<u64>,
    position: u64,
}

impl CacheEntry {
    const fn is_expired(&self, now_ms: u64) -> bool {
        match self.expires_at_ms {
            Some(expires_at) => now_ms >= expires_at,
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    order: BTreeMap<u64, String>,
    next_position: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn take_position(&mut self) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        position
    }

    fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some_and(|entry| {
            self.order.remove(&entry.position);
            true
        })
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        self.evictions += 1;
        Some(key)
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Entries in storage, including expired ones not yet read.
    pub size: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Cumulative hits since the last `clear`.
    pub hits: u64,
    /// Cumulative misses since the last `clear`.
    pub misses: u64,
    /// Cumulative capacity evictions since the last `clear`.
    pub evictions: u64,
    /// `hits / (hits + misses)`, or 0 with no lookups.
    pub hit_rate: f64,
}

/// Bounded TTL-aware cache.
///
/// # Example
///
/// ```rust
/// use realtime_relay::infrastructure::cache::{LocalCache, LocalCacheConfig};
///
/// let cache = LocalCache::new(LocalCacheConfig { capacity: 2 });
/// cache.set("a", "1", None);
/// cache.set("b", "2", None);
/// cache.set("c", "3", None);
///
/// assert_eq!(cache.get("a"), None);
/// assert_eq!(cache.get("b").as_deref(), Some("2"));
/// ```
#[derive(Debug)]
pub struct LocalCache {
    config: LocalCacheConfig,
    clock: SharedClock,
    inner: Mutex<CacheInner>,
}

impl LocalCache {
    /// Create a cache on the system clock.
    #[must_use]
    pub fn new(config: LocalCacheConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create a cache on a specific clock.
    #[must_use]
    pub fn with_clock(config: LocalCacheConfig, clock: SharedClock) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            config: LocalCacheConfig { capacity },
            clock,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Look up a key.
    ///
    /// Expired entries are removed and reported as a miss. A hit moves the
    /// entry to the newest position.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                drop(inner);
                metrics::record_local_cache_lookup(false);
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.remove(key);
            inner.misses += 1;
            drop(inner);
            tracing::trace!(key, "Local cache entry expired");
            metrics::record_local_cache_lookup(false);
            return None;
        }

        let new_position = inner.take_position();
        let CacheInner { entries, order, .. } = &mut *inner;
        let value = entries.get_mut(key).map(|entry| {
            order.remove(&entry.position);
            entry.position = new_position;
            order.insert(new_position, key.to_string());
            entry.value.clone()
        });
        inner.hits += 1;
        drop(inner);

        metrics::record_local_cache_lookup(true);
        value
    }

    /// Insert or overwrite a key.
    ///
    /// Inserting a new key at capacity evicts the oldest entry first.
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.insert(key, value, ttl, true);
    }

    /// Insert or overwrite without the capacity check.
    ///
    /// Used for bulk warming where the caller sized the batch. This skips
    /// eviction entirely, so the cache can grow past its capacity until the
    /// next `set` of a new key trims one entry.
    pub fn prefetch(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.insert(key, value, ttl, false);
    }

    fn insert(&self, key: &str, value: &str, ttl: Option<Duration>, enforce_capacity: bool) {
        let expires_at_ms = ttl.map(|ttl| {
            self.clock
                .now_millis()
                .saturating_add(duration_millis(ttl))
        });
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get_mut(key) {
            entry.value = value.to_string();
            entry.expires_at_ms = expires_at_ms;
            return;
        }

        if enforce_capacity && inner.entries.len() >= self.config.capacity {
            if let Some(evicted) = inner.evict_oldest() {
                tracing::trace!(key = %evicted, "Local cache evicted oldest entry");
            }
        }

        let position = inner.take_position();
        inner.order.insert(position, key.to_string());
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at_ms,
                position,
            },
        );
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key)
    }

    /// Remove every entry and reset statistics.
    pub fn clear(&self) {
        *self.inner.lock() = CacheInner::default();
    }

    /// Entries in storage.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether storage is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            inner.hits as f64 / lookups as f64
        };

        CacheStats {
            size: inner.entries.len(),
            capacity: self.config.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate,
        }
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(LocalCacheConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::domain::clock::ManualClock;

    fn cache_with_clock(capacity: usize) -> (LocalCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = LocalCache::with_clock(LocalCacheConfig { capacity }, clock.clone());
        (cache, clock)
    }

    #[test]
    fn set_then_get_round_trip() {
        let (cache, _) = cache_with_clock(10);
        cache.set("k", "v", Some(Duration::from_secs(5)));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn expired_entry_is_purged_on_read() {
        let (cache, clock) = cache_with_clock(10);
        cache.set("k", "v", Some(Duration::from_millis(100)));
        assert_eq!(cache.len(), 1);

        clock.advance(Duration::from_millis(100));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn expired_entry_stays_in_storage_until_read() {
        let (cache, clock) = cache_with_clock(10);
        cache.set("k", "v", Some(Duration::from_millis(10)));
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn entry_without_ttl_never_expires() {
        let (cache, clock) = cache_with_clock(10);
        cache.set("k", "v", None);
        clock.advance(Duration::from_secs(86_400));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn capacity_two_evicts_first_inserted() {
        let (cache, _) = cache_with_clock(2);
        cache.set("a", "1", None);
        cache.set("b", "2", None);
        cache.set("c", "3", None);

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b").as_deref(), Some("2"));
        assert_eq!(cache.get("c").as_deref(), Some("3"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn get_promotes_entry_away_from_eviction() {
        let (cache, _) = cache_with_clock(2);
        cache.set("a", "1", None);
        cache.set("b", "2", None);
        assert!(cache.get("a").is_some());

        cache.set("c", "3", None);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a").as_deref(), Some("1"));
    }

    #[test]
    fn set_does_not_promote_existing_key() {
        let (cache, _) = cache_with_clock(2);
        cache.set("a", "1", None);
        cache.set("b", "2", None);
        cache.set("a", "updated", None);

        cache.set("c", "3", None);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b").as_deref(), Some("2"));
    }

    #[test]
    fn overwrite_at_capacity_does_not_evict() {
        let (cache, _) = cache_with_clock(2);
        cache.set("a", "1", None);
        cache.set("b", "2", None);
        cache.set("b", "22", None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").as_deref(), Some("1"));
        assert_eq!(cache.get("b").as_deref(), Some("22"));
    }

    #[test]
    fn prefetch_bypasses_capacity() {
        let (cache, _) = cache_with_clock(2);
        cache.prefetch("a", "1", None);
        cache.prefetch("b", "2", None);
        cache.prefetch("c", "3", None);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a").as_deref(), Some("1"));
    }

    #[test]
    fn stats_track_hits_and_misses_until_clear() {
        let (cache, _) = cache_with_clock(10);
        cache.set("a", "1", None);
        let _ = cache.get("a");
        let _ = cache.get("a");
        let _ = cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert!(stats.hit_rate.abs() < f64::EPSILON);
    }

    #[test]
    fn delete_removes_entry() {
        let (cache, _) = cache_with_clock(10);
        cache.set("a", "1", None);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let (cache, _) = cache_with_clock(0);
        assert_eq!(cache.capacity(), 1);
        cache.set("a", "1", None);
        cache.set("b", "2", None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b").as_deref(), Some("2"));
    }

    proptest! {
        #[test]
        fn inserting_past_capacity_evicts_earliest(capacity in 1usize..64) {
            let (cache, _) = cache_with_clock(capacity);
            for i in 0..=capacity {
                cache.set(&format!("key-{i}"), "v", None);
            }

            prop_assert_eq!(cache.len(), capacity);
            prop_assert_eq!(cache.stats().evictions, 1);
            prop_assert!(cache.get("key-0").is_none());
            for i in 1..=capacity {
                let key = format!("key-{i}");
                prop_assert!(cache.get(&key).is_some());
            }
        }
    }
}
