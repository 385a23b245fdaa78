use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{CacheBackend, KeyTtl};
use crate::error::StoreError;
use crate::sweeper::spawn_sweeper;

#[derive(Clone, Debug)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process backend. Clones of the `Arc` behave like one shared server,
/// which lets tests run several gateway instances against the same grid.
///
/// Expiry follows the tokio clock, so paused-time tests can step past TTLs.
#[derive(Default)]
pub struct MemoryCache {
    map: DashMap<String, Slot>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.map.len())
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        spawn_sweeper("memory_cache", interval, cancel, move || {
            cache.purge_expired()
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let value = {
            let slot = self.map.get(key)?;
            slot.is_live(now).then(|| slot.value.clone())
        };
        if value.is_none() {
            self.map.remove_if(key, |_, slot| !slot.is_live(now));
        }
        value
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.map.insert(key.to_string(), Slot::new(value, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(Slot::new(value, Some(ttl)));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.live_value(key))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        Ok(keys.iter().map(|k| self.live_value(k)).collect())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .map
            .remove(key)
            .is_some_and(|(_, slot)| slot.is_live(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.map.get_mut(key) {
            Some(mut slot) if slot.is_live(now) => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let now = Instant::now();
        Ok(match self.map.get(key) {
            Some(slot) if slot.is_live(now) => match slot.expires_at {
                Some(at) => KeyTtl::Expires(at - now),
                None => KeyTtl::Persistent,
            },
            _ => KeyTtl::Missing,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live_value(key).is_some())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let matcher = glob::Pattern::new(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .map
            .iter()
            .filter(|e| e.value().is_live(now) && matcher.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .map
            .remove_if(key, |_, slot| slot.is_live(now) && slot.value == expected)
            .is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let now = Instant::now();
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let slot = occupied.get_mut();
                let current: i64 = slot.value.parse().map_err(|_| {
                    StoreError::Serialization(format!("{key} does not hold an integer"))
                })?;
                let next = current.checked_add(delta).ok_or_else(|| {
                    StoreError::Serialization(format!("{key} would overflow"))
                })?;
                slot.value = next.to_string();
                Ok(next)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(Slot::new(&delta.to_string(), None));
                Ok(delta)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(&delta.to_string(), None));
                Ok(delta)
            }
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
