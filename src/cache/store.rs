//! Key-value cache adapter contract.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {message}")]
    Backend { message: String },
    #[error("cached value could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CacheError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}

/// One page of a cursor-driven key scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next call; `0` once the whole keyspace has been visited.
    pub cursor: u64,
    pub keys: Vec<String>,
}

/// Operations the consistency layer needs from a shared cache.
///
/// Scans follow Redis `SCAN` semantics: start at cursor `0`, stop when the
/// returned cursor is `0` again. Every key present for the whole duration of a
/// scan is returned at least once; a page may be empty while the cursor is not
/// yet exhausted.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), CacheError>;

    /// Delete the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Visit up to `count` slots starting at `cursor`, returning keys matching
    /// the glob `pattern`.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize)
    -> Result<ScanPage, CacheError>;
}
