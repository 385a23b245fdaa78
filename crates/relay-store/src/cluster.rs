use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::ids::glob_escape;
use relay_core::Record;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::backend::{CacheBackend, KeyTtl};
use crate::error::StoreError;
use crate::keyspace::Keyspace;
use crate::kv::KvStore;
use crate::lock::{DistributedLock, LOCK_SUFFIX};

fn wall_deadline(remaining: Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
        + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Store on a shared backend, safe across processes.
///
/// Records are JSON under `<namespace>:<kind>:<key>`. `update_field` runs a
/// read-modify-write under the distributed lock of that key and writes the
/// entry back with the TTL it had before.
pub struct ClusterStore<R: Record> {
    backend: Arc<dyn CacheBackend>,
    lock: DistributedLock,
    prefix: String,
    cancel: CancellationToken,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> ClusterStore<R> {
    pub fn new(backend: Arc<dyn CacheBackend>, keyspace: &Keyspace, lock: DistributedLock) -> Self {
        Self {
            backend,
            lock,
            prefix: keyspace.prefix(R::KIND),
            cancel: CancellationToken::new(),
            _record: PhantomData,
        }
    }

    /// Abort lock waits when `cancel` fires (process shutdown).
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Lock keys share the record prefix; they are never records.
    fn is_record_key(full: &str) -> bool {
        !full.ends_with(LOCK_SUFFIX)
    }

    fn relative_key<'a>(&self, full: &'a str) -> &'a str {
        full.strip_prefix(self.prefix.as_str()).unwrap_or(full)
    }

    fn decode(&self, full: &str, raw: &str, ttl: KeyTtl) -> Result<R, StoreError> {
        let mut record: R = serde_json::from_str(raw)
            .map_err(|e| StoreError::Serialization(format!("{full}: {e}")))?;
        if let Some(remaining) = ttl.as_ttl() {
            record.set_expire_at(wall_deadline(remaining));
        }
        Ok(record)
    }

    async fn update_locked(&self, full: &str, update: &R::Update) -> Result<bool, StoreError> {
        let ttl = self.backend.ttl(full).await?;
        if ttl.is_missing() {
            return Ok(false);
        }
        let Some(raw) = self.backend.get(full).await? else {
            return Ok(false);
        };
        let mut record = self.decode(full, &raw, ttl)?;
        record.apply(update);
        let encoded = serde_json::to_string(&record)?;
        self.backend.set(full, &encoded, ttl.as_ttl()).await?;
        Ok(true)
    }
}

#[async_trait]
impl<R: Record> KvStore<R> for ClusterStore<R> {
    async fn save(&self, key: &str, record: &R, ttl: Duration) -> Result<(), StoreError> {
        let mut record = record.clone();
        record.set_expire_at(wall_deadline(ttl));
        let encoded = serde_json::to_string(&record)?;
        self.backend
            .set(&self.full_key(key), &encoded, Some(ttl))
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<R>, StoreError> {
        let full = self.full_key(key);
        let Some(raw) = self.backend.get(&full).await? else {
            return Ok(None);
        };
        let ttl = self.backend.ttl(&full).await?;
        if ttl.is_missing() {
            return Ok(None);
        }
        self.decode(&full, &raw, ttl).map(Some)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.backend.del(&self.full_key(key)).await
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.backend.expire(&self.full_key(key), ttl).await
    }

    async fn list(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let full_pattern = format!("{}{}", glob_escape(&self.prefix), pattern);
        let keys = self.backend.scan(&full_pattern).await?;
        Ok(keys
            .iter()
            .filter(|k| Self::is_record_key(k))
            .map(|k| self.relative_key(k).to_string())
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.backend.exists(&self.full_key(key)).await
    }

    async fn get_all(&self) -> Result<HashMap<String, R>, StoreError> {
        let keys: Vec<String> = self
            .backend
            .scan(&format!("{}*", glob_escape(&self.prefix)))
            .await?
            .into_iter()
            .filter(|k| Self::is_record_key(k))
            .collect();
        let values = self.backend.mget(&keys).await?;
        let mut out = HashMap::with_capacity(keys.len());
        for (full, raw) in keys.iter().zip(values) {
            let Some(raw) = raw else { continue };
            // `extend` renews the TTL without rewriting the payload.
            let ttl = self.backend.ttl(full).await?;
            if ttl.is_missing() {
                continue;
            }
            match self.decode(full, &raw, ttl) {
                Ok(record) => {
                    out.insert(self.relative_key(full).to_string(), record);
                }
                Err(e) => warn!(key = %full, error = %e, "skipping undecodable record"),
            }
        }
        Ok(out)
    }

    #[instrument(skip(self, update), fields(kind = R::KIND))]
    async fn update_field(&self, key: &str, update: R::Update) -> Result<bool, StoreError> {
        let full = self.full_key(key);
        let guard = self.lock.acquire(&full, &self.cancel).await?;
        let result = self.update_locked(&full, &update).await;
        if let Err(e) = guard.release().await {
            warn!(key = %full, error = %e, "failed to release lock");
        }
        result
    }
}
