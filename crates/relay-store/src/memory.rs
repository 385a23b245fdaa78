use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::Record;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::kv::KvStore;
use crate::sweeper::spawn_sweeper;

struct Stored<R> {
    record: R,
    expires_at: Instant,
}

fn wall_deadline(remaining: Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
        + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Single-process store. Per-key atomicity comes from the map's shard locks,
/// so no distributed lock is involved.
pub struct MemoryStore<R: Record> {
    entries: DashMap<String, Stored<R>>,
}

impl<R: Record> Default for MemoryStore<R> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<R: Record> MemoryStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Periodically drop expired entries until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        spawn_sweeper(R::KIND, interval, cancel, move || store.purge_expired())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live_copy(&self, key: &str, now: Instant) -> Option<R> {
        let stored = self.entries.get(key)?;
        if stored.expires_at <= now {
            return None;
        }
        let mut record = stored.record.clone();
        record.set_expire_at(wall_deadline(stored.expires_at - now));
        Some(record)
    }
}

#[async_trait]
impl<R: Record> KvStore<R> for MemoryStore<R> {
    async fn save(&self, key: &str, record: &R, ttl: Duration) -> Result<(), StoreError> {
        let mut record = record.clone();
        record.set_expire_at(wall_deadline(ttl));
        self.entries.insert(
            key.to_string(),
            Stored {
                record,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<R>, StoreError> {
        let now = Instant::now();
        let found = self.live_copy(key, now);
        if found.is_none() {
            self.entries.remove_if(key, |_, s| s.expires_at <= now);
        }
        Ok(found)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, s)| s.expires_at > now))
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut stored) if stored.expires_at > now => {
                stored.expires_at = now + ttl;
                stored.record.set_expire_at(wall_deadline(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let matcher = glob::Pattern::new(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at > now && matcher.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .is_some_and(|s| s.expires_at > now))
    }

    async fn get_all(&self) -> Result<HashMap<String, R>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.value().expires_at > now)
            .map(|e| {
                let mut record = e.value().record.clone();
                record.set_expire_at(wall_deadline(e.value().expires_at - now));
                (e.key().clone(), record)
            })
            .collect())
    }

    async fn update_field(&self, key: &str, update: R::Update) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut stored) if stored.expires_at > now => {
                stored.record.apply(&update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
