//! In-process cache with Redis-like expiry and scan semantics.
//!
//! Keys occupy stable slots so that a scan cursor (a slot index) never skips
//! a key that stays present for the whole scan, even while other keys are
//! deleted between pages. Freed slots are reused by later inserts.
//!
//! The key index is an LRU bounded by `max_entries`: inserting past the bound
//! evicts the least recently used key. Expired entries are reclaimed by scans
//! and by a periodic sweep on insert.
//!
//! Expiry uses `tokio::time::Instant`, so tests can drive it with a paused
//! clock.

use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use tokio::time::Instant;

use super::config::CacheConfig;
use super::pattern::glob_matches;
use super::store::{CacheError, CacheStore, ScanPage};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::memory";
const DEFAULT_SCAN_COUNT: usize = 10;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const METRIC_CACHE_EVICTED: &str = "ripple_cache_evicted_total";

#[derive(Debug)]
struct Entry {
    key: String,
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

struct Slots {
    slots: Vec<Option<Entry>>,
    index: LruCache<String, usize>,
    free: Vec<usize>,
    last_sweep: Option<Instant>,
}

impl Slots {
    fn new(max_entries: NonZeroUsize) -> Self {
        Self {
            slots: Vec::new(),
            index: LruCache::new(max_entries),
            free: Vec::new(),
            last_sweep: None,
        }
    }

    fn release(&mut self, slot: usize) -> Option<Entry> {
        let entry = self.slots[slot].take()?;
        self.free.push(slot);
        Some(entry)
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let slot = self.index.pop(key)?;
        self.release(slot)
    }

    /// Value of a live entry, marking it recently used. Expired entries are dropped.
    fn live_value(&mut self, key: &str, now: Instant) -> Option<String> {
        let slot = self.index.get(key).copied()?;
        if let Some(entry) = self.slots[slot].as_ref().filter(|entry| entry.is_live(now)) {
            return Some(entry.value.clone());
        }
        self.remove(key);
        None
    }

    fn insert(&mut self, entry: Entry, now: Instant) {
        if let Some(slot) = self.index.get(entry.key.as_str()).copied() {
            self.slots[slot] = Some(entry);
            return;
        }

        let due = self
            .last_sweep
            .is_none_or(|last| now.duration_since(last) >= SWEEP_INTERVAL);
        if due {
            self.last_sweep = Some(now);
            self.reclaim(0..self.slots.len(), now);
            self.compact();
        }

        if self.index.len() >= self.index.cap().get()
            && let Some((_, slot)) = self.index.pop_lru()
        {
            self.release(slot);
            counter!(METRIC_CACHE_EVICTED).increment(1);
        }

        let key = entry.key.clone();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.put(key, slot);
    }

    /// Drop expired entries stored in `range`.
    fn reclaim(&mut self, range: Range<usize>, now: Instant) {
        for slot in range {
            let expired = self.slots[slot]
                .as_ref()
                .is_some_and(|entry| !entry.is_live(now));
            if expired && let Some(entry) = self.release(slot) {
                self.index.pop(entry.key.as_str());
            }
        }
    }

    /// Shrink trailing free slots.
    fn compact(&mut self) {
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        let len = self.slots.len();
        self.free.retain(|&slot| slot < len);
    }
}

/// Cache used when no Redis URL is configured, and by tests.
pub struct InMemoryCache {
    inner: RwLock<Slots>,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::with_max_entries(CacheConfig::default().max_entries_non_zero())
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(max_entries: NonZeroUsize) -> Self {
        Self {
            inner: RwLock::new(Slots::new(max_entries)),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        rw_read(&self.inner, SOURCE, "len")
            .slots
            .iter()
            .flatten()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots currently allocated, whether live or awaiting reclaim.
    pub fn allocated(&self) -> usize {
        rw_read(&self.inner, SOURCE, "allocated").slots.len()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let mut inner = rw_write(&self.inner, SOURCE, "get");
        Ok(inner.live_value(key, now))
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let now = Instant::now();
        let entry = Entry {
            key: key.to_string(),
            value: value.to_string(),
            expires_at: now + ttl,
        };

        let mut inner = rw_write(&self.inner, SOURCE, "set_with_expiry");
        inner.insert(entry, now);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut inner = rw_write(&self.inner, SOURCE, "delete");
        let removed = keys
            .iter()
            .filter_map(|key| inner.remove(key))
            .filter(|entry| entry.is_live(now))
            .count();
        inner.compact();
        Ok(removed as u64)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<ScanPage, CacheError> {
        let now = Instant::now();
        let mut inner = rw_write(&self.inner, SOURCE, "scan");
        let count = if count == 0 { DEFAULT_SCAN_COUNT } else { count };
        let start = usize::try_from(cursor).unwrap_or(usize::MAX);
        if start >= inner.slots.len() {
            return Ok(ScanPage::default());
        }

        let end = start.saturating_add(count).min(inner.slots.len());
        inner.reclaim(start..end, now);
        let keys = inner.slots[start..end]
            .iter()
            .flatten()
            .filter(|entry| glob_matches(pattern, &entry.key))
            .map(|entry| entry.key.clone())
            .collect();

        let cursor = if end >= inner.slots.len() {
            0
        } else {
            end as u64
        };
        inner.compact();
        Ok(ScanPage { cursor, keys })
    }
}
