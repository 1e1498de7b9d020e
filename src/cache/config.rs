//! Cache configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_SCAN_COUNT: usize = 100;
const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Tuning for the cache-consistency layer.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Lifetime of every entry written by a cache fill.
    pub ttl: Duration,
    /// `COUNT` hint passed to each scan page during pattern invalidation.
    pub scan_count: usize,
    /// Key bound of the in-process store; Redis enforces its own.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            scan_count: DEFAULT_SCAN_COUNT,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            ttl: settings.ttl,
            scan_count: settings.scan_count.get(),
            max_entries: settings.max_entries.get(),
        }
    }
}

impl CacheConfig {
    /// Returns the in-process key bound as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}
