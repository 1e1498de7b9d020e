//! Cache-consistency layer.
//!
//! Reads are cache-aside: look up, fall back to the authoritative loader on a
//! miss, then fill with the configured TTL. Read-path cache failures degrade to
//! uncached reads.
//!
//! Invalidations return errors instead of swallowing them: callers await them
//! before reporting a write as done or acknowledging an event.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::config::CacheConfig;
use super::keys::{CacheKey, KeyPattern};
use super::store::{CacheError, CacheStore};

const METRIC_CACHE_HIT: &str = "ripple_cache_hit_total";
const METRIC_CACHE_MISS: &str = "ripple_cache_miss_total";
const METRIC_CACHE_DEGRADED: &str = "ripple_cache_degraded_total";
const METRIC_CACHE_INVALIDATED: &str = "ripple_cache_invalidated_keys_total";

#[derive(Clone)]
pub struct CacheLayer {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    // Bumped before every invalidation. A fill that raced with one removes
    // its own entry again.
    generation: Arc<AtomicU64>,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Look up and decode a cached value. Any failure is reported as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let rendered = key.to_string();
        let raw = match self.store.get(&rendered).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                counter!(METRIC_CACHE_MISS).increment(1);
                return None;
            }
            Err(err) => {
                counter!(METRIC_CACHE_DEGRADED, "op" => "get").increment(1);
                warn!(cache_key = %rendered, error = %err, "Cache read failed, serving uncached");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                counter!(METRIC_CACHE_HIT).increment(1);
                debug!(cache_key = %rendered, "Cache hit");
                Some(value)
            }
            Err(err) => {
                counter!(METRIC_CACHE_MISS).increment(1);
                warn!(cache_key = %rendered, error = %err, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Store a value with the configured TTL. Failures are logged, not returned.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) {
        let rendered = key.to_string();
        if let Err(err) = self.try_set(&rendered, value).await {
            counter!(METRIC_CACHE_DEGRADED, "op" => "set").increment(1);
            warn!(cache_key = %rendered, error = %err, "Cache fill failed");
        }
    }

    async fn try_set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let encoded = serde_json::to_string(value)?;
        self.store
            .set_with_expiry(key, &encoded, self.config.ttl)
            .await
    }

    /// Cache-aside read. Only `Some` results are cached.
    pub async fn read_through<T, E, F, Fut>(&self, key: &CacheKey, load: F) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        if let Some(cached) = self.get(key).await {
            return Ok(Some(cached));
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let loaded = load().await?;
        if let Some(value) = loaded.as_ref() {
            self.set(key, value).await;
            if self.generation.load(Ordering::SeqCst) != generation {
                // An invalidation ran while we loaded; the value may predate it.
                let rendered = key.to_string();
                if let Err(err) = self.store.delete(std::slice::from_ref(&rendered)).await {
                    counter!(METRIC_CACHE_DEGRADED, "op" => "invalidate").increment(1);
                    warn!(
                        cache_key = %rendered,
                        error = %err,
                        "Failed to discard a fill that raced an invalidation"
                    );
                }
            }
        }
        Ok(loaded)
    }

    /// Delete one exact key.
    pub async fn invalidate_key(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let rendered = key.to_string();
        let removed = self.store.delete(std::slice::from_ref(&rendered)).await?;
        counter!(METRIC_CACHE_INVALIDATED).increment(removed);
        info!(cache_key = %rendered, removed, "Cache key invalidated");
        Ok(())
    }

    /// Delete every key in a namespace.
    pub async fn invalidate_by_pattern(&self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        self.invalidate_glob(&pattern.glob()).await
    }

    /// Scan the whole keyspace for `glob` and delete matches page by page,
    /// until the cursor comes back to `0`.
    pub async fn invalidate_glob(&self, glob: &str) -> Result<usize, CacheError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut cursor = 0u64;
        let mut removed = 0usize;
        loop {
            let page = self
                .store
                .scan(cursor, glob, self.config.scan_count)
                .await?;
            if !page.keys.is_empty() {
                let deleted = self.store.delete(&page.keys).await?;
                counter!(METRIC_CACHE_INVALIDATED).increment(deleted);
                removed += usize::try_from(deleted).unwrap_or(usize::MAX);
                debug!(pattern = glob, keys = ?page.keys, "Cache keys invalidated");
            }
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        info!(pattern = glob, removed, "Cache namespace invalidated");
        Ok(removed)
    }
}
