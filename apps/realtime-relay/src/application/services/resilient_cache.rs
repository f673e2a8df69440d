//! Resilient Cache
//!
//! Failure-safe key/value operations composed from the local cache and the
//! gated upstream. Upstream problems never surface as errors here: reads
//! degrade to the local cache or a miss, writes always land locally.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::gate::UpstreamGate;
use crate::domain::keys::CacheKey;
use crate::infrastructure::cache::LocalCache;

/// Default TTL for values cached without an explicit one.
pub const DEFAULT_VALUE_TTL: Duration = Duration::from_secs(300);

/// Read-through cache over the shared upstream.
#[derive(Debug, Clone)]
pub struct ResilientCache {
    local: Arc<LocalCache>,
    gate: UpstreamGate,
    default_ttl: Duration,
}

impl ResilientCache {
    /// Create a cache.
    #[must_use]
    pub const fn new(local: Arc<LocalCache>, gate: UpstreamGate) -> Self {
        Self {
            local,
            gate,
            default_ttl: DEFAULT_VALUE_TTL,
        }
    }

    /// Override the default TTL.
    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// The local cache tier.
    #[must_use]
    pub const fn local(&self) -> &Arc<LocalCache> {
        &self.local
    }

    /// The upstream gate.
    #[must_use]
    pub const fn gate(&self) -> &UpstreamGate {
        &self.gate
    }

    /// Read a key.
    ///
    /// Served locally when possible; otherwise read upstream and cached
    /// locally with the default TTL. Any upstream problem is a miss.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.get_with_ttl(key, self.default_ttl).await
    }

    async fn get_with_ttl(&self, key: &str, ttl: Duration) -> Option<String> {
        if let Some(value) = self.local.get(key) {
            return Some(value);
        }

        let value = self
            .gate
            .run("get", |upstream| async move { upstream.get(key).await })
            .await
            .ok()
            .flatten()?;

        self.local.set(key, &value, Some(ttl));
        Some(value)
    }

    /// Write a key locally, then upstream on a best-effort basis.
    ///
    /// Returns whether the upstream write succeeded.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.local.set(key, value, Some(ttl));

        self.gate
            .run("set", |upstream| async move {
                upstream.set(key, value, Some(ttl)).await
            })
            .await
            .is_ok()
    }

    /// Delete a key locally, then upstream on a best-effort basis.
    ///
    /// Returns whether the upstream delete succeeded.
    pub async fn delete(&self, key: &str) -> bool {
        self.local.delete(key);

        self.gate
            .run("delete", |upstream| async move { upstream.delete(key).await })
            .await
            .is_ok()
    }

    /// Read many keys, preserving input order.
    ///
    /// Local hits are served first; the remaining keys are fetched in one
    /// upstream round trip.
    pub async fn mget(&self, keys: &[&str]) -> Vec<Option<String>> {
        let mut values: Vec<Option<String>> = keys.iter().map(|key| self.local.get(key)).collect();

        let missing: Vec<usize> = values
            .iter()
            .enumerate()
            .filter_map(|(index, value)| value.is_none().then_some(index))
            .collect();
        if missing.is_empty() {
            return values;
        }

        let missing_keys: Vec<String> = missing.iter().map(|&i| keys[i].to_string()).collect();
        let batch = &missing_keys;
        let Ok(fetched) = self
            .gate
            .run("mget", |upstream| async move { upstream.mget(batch).await })
            .await
        else {
            return values;
        };

        for (&index, value) in missing.iter().zip(fetched) {
            if let Some(value) = value {
                self.local.set(keys[index], &value, Some(self.default_ttl));
                values[index] = Some(value);
            }
        }
        values
    }

    /// Warm the local tier without touching the upstream or the capacity
    /// check.
    pub fn warm<'a>(&self, entries: impl IntoIterator<Item = (&'a str, &'a str)>, ttl: Duration) {
        for (key, value) in entries {
            self.local.prefetch(key, value, Some(ttl));
        }
    }

    // =========================================================================
    // Typed Helpers
    // =========================================================================

    /// Read and decode a JSON value.
    ///
    /// A value that fails to decode is evicted locally and reported as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        self.decode(key, &raw)
    }

    /// Encode and write a JSON value.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl).await,
            Err(error) => {
                tracing::warn!(key, error = %error, "Failed to encode cache value");
                false
            }
        }
    }

    /// Read an entity under its namespaced key and kind TTL.
    pub async fn get_entity<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = self
            .get_with_ttl(key.as_str(), key.kind().default_ttl())
            .await?;
        self.decode(key.as_str(), &raw)
    }

    /// Write an entity under its namespaced key and kind TTL.
    pub async fn set_entity<T: Serialize>(&self, key: &CacheKey, value: &T) -> bool {
        self.set_json(key.as_str(), value, Some(key.kind().default_ttl()))
            .await
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, raw: &str) -> Option<T> {
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(key, error = %error, "Dropping undecodable cache value");
                self.local.delete(key);
                None
            }
        }
    }
}
