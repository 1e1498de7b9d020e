//! Ripple Cache System
//!
//! Read-path services share one key-value cache. This module provides:
//!
//! - **Store adapters**: [`CacheStore`] implemented by Redis and by an
//!   in-process map with the same expiry and cursor-scan semantics.
//! - **Keys**: typed [`CacheKey`] / [`KeyPattern`] values rendering the
//!   `post:<id>`, `posts:<page>:<limit>` and `search:user:<uid>:query:<q>`
//!   namespaces.
//! - **Consistency layer**: [`CacheLayer`] with cache-aside reads and exact-key
//!   or pattern-scan invalidation.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! url = "redis://127.0.0.1:6379"
//! ttl_seconds = 300
//! scan_count = 100
//! ```

mod config;
mod keys;
mod layer;
mod memory;
mod pattern;
mod redis_store;
mod store;

pub use config::CacheConfig;
pub use keys::{CacheKey, KeyPattern};
pub use layer::CacheLayer;
pub use memory::InMemoryCache;
pub use pattern::{escape_glob, glob_matches};
pub use redis_store::RedisCache;
pub use store::{CacheError, CacheStore, ScanPage};
