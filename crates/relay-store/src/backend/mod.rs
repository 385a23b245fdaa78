//! String key/value backends with per-key expiry.
//!
//! Every cross-process guarantee of the gateway (the distributed lock, shared
//! session records, cluster monitoring) is built on this small command set.

mod memory;
mod redis;
mod sqlite;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;
pub use self::sqlite::SqliteCache;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Remaining lifetime of a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    /// Present without an expiry.
    Persistent,
    Expires(Duration),
}

impl KeyTtl {
    pub fn is_missing(self) -> bool {
        matches!(self, Self::Missing)
    }

    /// The TTL to write back when re-saving the key unchanged.
    pub fn as_ttl(self) -> Option<Duration> {
        match self {
            Self::Expires(d) => Some(d),
            _ => None,
        }
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Unconditional write. `None` stores the key without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Write only if the key is absent. Returns whether this call wrote it.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Batch read; the result is positionally aligned with `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Reset the TTL of a live key. `false` when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Live keys matching a glob pattern (`*`, `?`, `[...]`), sorted.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Delete the key only if it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Atomic integer add; a missing key counts as 0.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    fn name(&self) -> &'static str;
}
