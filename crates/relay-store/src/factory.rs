use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use relay_core::presence::{ChannelPresence, TypingState};
use relay_core::session::SessionEntry;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{CacheBackend, MemoryCache, RedisCache, SqliteCache};
use crate::cluster::ClusterStore;
use crate::error::StoreError;
use crate::keyspace::Keyspace;
use crate::kv::KvStore;
use crate::lock::{DistributedLock, LockConfig};
use crate::memory::MemoryStore;
use crate::monitoring::{MonitoringConfig, MonitoringStore};
use crate::typing::{TypingConfig, TypingStore};

/// Where gateway state lives.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Single process; records in local maps.
    #[default]
    Memory,
    /// Processes on one host sharing a database file.
    Sqlite { path: PathBuf },
    /// A cluster sharing a Redis server.
    Redis { url: String },
}

#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub namespace: String,
    pub lock: LockConfig,
    pub typing: TypingConfig,
    pub monitoring: MonitoringConfig,
    pub sweep_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            namespace: "relay".into(),
            lock: LockConfig::default(),
            typing: TypingConfig::default(),
            monitoring: MonitoringConfig::default(),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Every store the gateway needs, on one backend.
pub struct Stores {
    pub backend: Arc<dyn CacheBackend>,
    pub sessions: Arc<dyn KvStore<SessionEntry>>,
    pub presence: Arc<dyn KvStore<ChannelPresence>>,
    pub typing: TypingStore,
    pub monitoring: MonitoringStore,
    pub sweepers: Vec<JoinHandle<()>>,
}

impl Stores {
    /// Process-local stores. Sweepers stop when `cancel` fires.
    pub fn in_memory(options: &StoreOptions, cancel: CancellationToken) -> Self {
        let cache = Arc::new(MemoryCache::new());
        let sessions = Arc::new(MemoryStore::<SessionEntry>::new());
        let presence = Arc::new(MemoryStore::<ChannelPresence>::new());
        let typing = Arc::new(MemoryStore::<TypingState>::new());
        let sweepers = vec![
            cache.spawn_sweeper(options.sweep_interval, cancel.clone()),
            sessions.spawn_sweeper(options.sweep_interval, cancel.clone()),
            presence.spawn_sweeper(options.sweep_interval, cancel.clone()),
            typing.spawn_sweeper(options.sweep_interval, cancel),
        ];
        let backend: Arc<dyn CacheBackend> = cache;
        Self {
            monitoring: MonitoringStore::new(
                Arc::clone(&backend),
                Keyspace::new(options.namespace.clone()),
                options.monitoring.clone(),
            ),
            typing: TypingStore::new(typing, options.typing.clone()),
            backend,
            sessions,
            presence,
            sweepers,
        }
    }

    /// Lock-protected stores on a shared backend. Several `Stores` built on
    /// the same backend behave like separate gateway processes.
    pub fn shared(
        backend: Arc<dyn CacheBackend>,
        options: &StoreOptions,
        cancel: CancellationToken,
    ) -> Self {
        let keyspace = Keyspace::new(options.namespace.clone());
        let lock = DistributedLock::new(Arc::clone(&backend), options.lock.clone());
        let sessions = ClusterStore::<SessionEntry>::new(Arc::clone(&backend), &keyspace, lock.clone())
            .with_cancel(cancel.clone());
        let presence =
            ClusterStore::<ChannelPresence>::new(Arc::clone(&backend), &keyspace, lock.clone())
                .with_cancel(cancel.clone());
        let typing = ClusterStore::<TypingState>::new(Arc::clone(&backend), &keyspace, lock)
            .with_cancel(cancel);
        Self {
            sessions: Arc::new(sessions),
            presence: Arc::new(presence),
            typing: TypingStore::new(Arc::new(typing), options.typing.clone()),
            monitoring: MonitoringStore::new(
                Arc::clone(&backend),
                keyspace,
                options.monitoring.clone(),
            ),
            backend,
            sweepers: Vec::new(),
        }
    }
}

/// Open the configured backend and build the stores on it.
pub async fn open_stores(
    config: &BackendConfig,
    options: &StoreOptions,
    cancel: CancellationToken,
) -> Result<Stores, StoreError> {
    let stores = match config {
        BackendConfig::Memory => Stores::in_memory(options, cancel),
        BackendConfig::Sqlite { path } => {
            let cache = Arc::new(SqliteCache::open(path)?);
            let sweeper = spawn_sqlite_purge(Arc::clone(&cache), options.sweep_interval, cancel.clone());
            let mut stores = Stores::shared(cache, options, cancel);
            stores.sweepers.push(sweeper);
            stores
        }
        BackendConfig::Redis { url } => {
            let cache = Arc::new(RedisCache::connect(url).await?);
            Stores::shared(cache, options, cancel)
        }
    };
    stores.backend.ping().await?;
    info!(
        backend = stores.backend.name(),
        namespace = %options.namespace,
        "state stores ready"
    );
    Ok(stores)
}

fn spawn_sqlite_purge(
    cache: Arc<SqliteCache>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match cache.purge_expired().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "purged expired sqlite rows"),
                    Err(e) => warn!(error = %e, "sqlite purge failed"),
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::session::SessionUpdate;
    use relay_core::SessionKey;

    #[test]
    fn backend_config_serde() {
        let json = serde_json::json!({"kind": "sqlite", "path": "/tmp/relay.db"});
        let cfg: BackendConfig = serde_json::from_value(json).unwrap();
        assert_eq!(
            cfg,
            BackendConfig::Sqlite {
                path: PathBuf::from("/tmp/relay.db")
            }
        );
        let memory: BackendConfig = serde_json::from_str(r#"{"kind":"memory"}"#).unwrap();
        assert_eq!(memory, BackendConfig::Memory);
    }

    #[tokio::test]
    async fn open_memory_stores() {
        let cancel = CancellationToken::new();
        let stores = open_stores(&BackendConfig::Memory, &StoreOptions::default(), cancel.clone())
            .await
            .unwrap();
        assert_eq!(stores.backend.name(), "memory");
        assert_eq!(stores.sweepers.len(), 4);
        cancel.cancel();
        for s in stores.sweepers {
            s.await.unwrap();
        }
    }

    #[tokio::test]
    async fn shared_stores_see_each_other() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
        let options = StoreOptions::default();
        let a = Stores::shared(Arc::clone(&backend), &options, CancellationToken::new());
        let b = Stores::shared(Arc::clone(&backend), &options, CancellationToken::new());
        let key = SessionKey::new("c".into(), "u".into());
        a.sessions
            .save(
                &key.to_string(),
                &SessionEntry::new(key.clone(), chrono::Utc::now()),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(b
            .sessions
            .update_field(&key.to_string(), SessionUpdate::IncrementFocus)
            .await
            .unwrap());
        let got = a.sessions.get(&key.to_string()).await.unwrap().unwrap();
        assert_eq!(got.focus_score, 1);
    }
}
