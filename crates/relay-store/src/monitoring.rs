//! Cluster monitoring: server heartbeats, per-worker activity and global
//! counters, all on the shared backend so any instance can report on the
//! whole cluster.
//!
//! Reads take an explicit `now` in their `_at` variants; the plain variants
//! use the wall clock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_core::ids::glob_escape;
use relay_core::monitor::{GlobalStats, PoolType, ServerInfo, StatKind, WorkerActivity};
use relay_core::ServerId;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::backend::CacheBackend;
use crate::error::StoreError;
use crate::keyspace::Keyspace;

const KIND: &str = "monitor";

#[derive(Clone, Debug)]
pub struct MonitoringConfig {
    /// A server whose last heartbeat is older than this is not active.
    pub server_staleness: Duration,
    /// Idle worker records older than this are hidden.
    pub worker_idle_ttl: Duration,
    /// Backend expiry of heartbeat and worker records.
    pub record_ttl: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            server_staleness: Duration::from_secs(60),
            worker_idle_ttl: Duration::from_secs(120),
            record_ttl: Duration::from_secs(600),
        }
    }
}

fn older_than(now: DateTime<Utc>, at: DateTime<Utc>, limit: Duration) -> bool {
    now.signed_duration_since(at)
        .to_std()
        .map_or(false, |age| age > limit)
}

#[derive(Clone)]
pub struct MonitoringStore {
    backend: Arc<dyn CacheBackend>,
    keyspace: Keyspace,
    config: MonitoringConfig,
}

impl MonitoringStore {
    pub fn new(backend: Arc<dyn CacheBackend>, keyspace: Keyspace, config: MonitoringConfig) -> Self {
        Self {
            backend,
            keyspace,
            config,
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    fn server_key(&self, server: &ServerId) -> String {
        self.keyspace.key(KIND, &format!("server:{server}"))
    }

    fn worker_key(&self, server: &ServerId, pool: PoolType, worker_id: u32) -> String {
        self.keyspace
            .key(KIND, &format!("worker:{server}:{pool}:{worker_id}"))
    }

    fn stat_key(&self, kind: StatKind) -> String {
        self.keyspace.key(KIND, &format!("stat:{}", kind.as_str()))
    }

    async fn load_all<T: DeserializeOwned>(&self, pattern: &str) -> Result<Vec<T>, StoreError> {
        let keys = self.backend.scan(pattern).await?;
        let values = self.backend.mget(&keys).await?;
        let mut out = Vec::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(values) {
            let Some(raw) = raw else { continue };
            match serde_json::from_str(&raw) {
                Ok(v) => out.push(v),
                Err(e) => warn!(key = %key, error = %e, "skipping undecodable monitor record"),
            }
        }
        Ok(out)
    }

    pub async fn report_heartbeat(
        &self,
        server: &ServerId,
        uptime: Duration,
        version: &str,
    ) -> Result<(), StoreError> {
        self.report_heartbeat_at(server, uptime, version, Utc::now())
            .await
    }

    pub async fn report_heartbeat_at(
        &self,
        server: &ServerId,
        uptime: Duration,
        version: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let started_at = now
            - chrono::Duration::from_std(uptime).unwrap_or_else(|_| chrono::Duration::zero());
        let info = ServerInfo {
            server_id: server.clone(),
            started_at,
            last_seen: now,
            uptime_secs: uptime.as_secs(),
            version: version.to_string(),
        };
        let encoded = serde_json::to_string(&info)?;
        self.backend
            .set(&self.server_key(server), &encoded, Some(self.config.record_ttl))
            .await
    }

    pub async fn get_active_servers(&self) -> Result<Vec<ServerInfo>, StoreError> {
        self.get_active_servers_at(Utc::now()).await
    }

    /// Servers whose last heartbeat is within the staleness window.
    pub async fn get_active_servers_at(&self, now: DateTime<Utc>) -> Result<Vec<ServerInfo>, StoreError> {
        let pattern = format!("{}*", glob_escape(&self.keyspace.key(KIND, "server:")));
        let mut servers: Vec<ServerInfo> = self
            .load_all::<ServerInfo>(&pattern)
            .await?
            .into_iter()
            .filter(|s| !older_than(now, s.last_seen, self.config.server_staleness))
            .collect();
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(servers)
    }

    pub async fn update_worker_activity(&self, activity: &WorkerActivity) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(activity)?;
        self.backend
            .set(
                &self.worker_key(&activity.server_id, activity.pool, activity.worker_id),
                &encoded,
                Some(self.config.record_ttl),
            )
            .await
    }

    pub async fn get_cluster_activity(&self) -> Result<Vec<WorkerActivity>, StoreError> {
        self.get_cluster_activity_at(Utc::now()).await
    }

    /// Worker records of active servers, omitting idle records that have
    /// not been refreshed within the idle TTL.
    pub async fn get_cluster_activity_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkerActivity>, StoreError> {
        let active: HashSet<ServerId> = self
            .get_active_servers_at(now)
            .await?
            .into_iter()
            .map(|s| s.server_id)
            .collect();
        let pattern = format!("{}*", glob_escape(&self.keyspace.key(KIND, "worker:")));
        let mut workers: Vec<WorkerActivity> = self
            .load_all::<WorkerActivity>(&pattern)
            .await?
            .into_iter()
            .filter(|w| active.contains(&w.server_id))
            .filter(|w| w.is_processing || !older_than(now, w.updated_at, self.config.worker_idle_ttl))
            .collect();
        workers.sort_by(|a, b| {
            a.server_id
                .cmp(&b.server_id)
                .then_with(|| a.pool.as_str().cmp(b.pool.as_str()))
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        Ok(workers)
    }

    /// Remove the heartbeat and every worker record of a server leaving the
    /// cluster.
    pub async fn remove_server(&self, server: &ServerId) -> Result<usize, StoreError> {
        let mut removed = usize::from(self.backend.del(&self.server_key(server)).await?);
        let pattern = format!(
            "{}*",
            glob_escape(&self.keyspace.key(KIND, &format!("worker:{server}:")))
        );
        for key in self.backend.scan(&pattern).await? {
            removed += usize::from(self.backend.del(&key).await?);
        }
        Ok(removed)
    }

    /// Add to a cluster-wide counter.
    pub async fn increment_stat(&self, kind: StatKind, delta: i64) -> Result<i64, StoreError> {
        self.backend.incr_by(&self.stat_key(kind), delta).await
    }

    /// Overwrite a cluster-wide gauge.
    pub async fn update_stat(&self, kind: StatKind, value: i64) -> Result<(), StoreError> {
        self.backend
            .set(&self.stat_key(kind), &value.to_string(), None)
            .await
    }

    pub async fn get_global_stats(&self) -> Result<GlobalStats, StoreError> {
        let keys: Vec<String> = StatKind::ALL.iter().map(|k| self.stat_key(*k)).collect();
        let values = self.backend.mget(&keys).await?;
        let mut stats = GlobalStats::default();
        for (kind, raw) in StatKind::ALL.iter().zip(values) {
            let value = raw.and_then(|r| r.parse::<i64>().ok()).unwrap_or(0);
            stats.set(*kind, value);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryCache;
    use relay_core::SessionKey;

    fn store() -> MonitoringStore {
        MonitoringStore::new(
            Arc::new(MemoryCache::new()),
            Keyspace::new("t"),
            MonitoringConfig::default(),
        )
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[tokio::test]
    async fn stale_servers_are_filtered() {
        let m = store();
        let now = Utc::now();
        let (a, b) = (ServerId::from_raw("a"), ServerId::from_raw("b"));
        m.report_heartbeat_at(&a, Duration::from_secs(5), "0.1.0", now - secs(10))
            .await
            .unwrap();
        m.report_heartbeat_at(&b, Duration::from_secs(5), "0.1.0", now - secs(90))
            .await
            .unwrap();
        let active = m.get_active_servers_at(now).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].server_id, a);
    }

    #[tokio::test]
    async fn cluster_activity_filters_dead_servers_and_idle_workers() {
        let m = store();
        let now = Utc::now();
        let (live, dead) = (ServerId::from_raw("live"), ServerId::from_raw("dead"));
        m.report_heartbeat_at(&live, Duration::ZERO, "v", now).await.unwrap();
        m.report_heartbeat_at(&dead, Duration::ZERO, "v", now - secs(120))
            .await
            .unwrap();

        let key = SessionKey::new("c".into(), "u".into());
        let busy = WorkerActivity::busy(live.clone(), PoolType::Processing, 0, key.clone(), now - secs(600));
        let fresh_idle = WorkerActivity::idle(live.clone(), PoolType::Processing, 1, now - secs(30));
        let stale_idle = WorkerActivity::idle(live.clone(), PoolType::Outbound, 0, now - secs(300));
        let orphan = WorkerActivity::busy(dead.clone(), PoolType::Processing, 0, key, now);
        for w in [&busy, &fresh_idle, &stale_idle, &orphan] {
            m.update_worker_activity(w).await.unwrap();
        }

        let activity = m.get_cluster_activity_at(now).await.unwrap();
        let ids: Vec<(PoolType, u32)> = activity.iter().map(|w| (w.pool, w.worker_id)).collect();
        assert_eq!(ids, vec![(PoolType::Processing, 0), (PoolType::Processing, 1)]);
    }

    #[tokio::test]
    async fn stats_counters_and_gauges() {
        let m = store();
        assert_eq!(m.get_global_stats().await.unwrap(), GlobalStats::default());
        m.increment_stat(StatKind::Processed, 1).await.unwrap();
        m.increment_stat(StatKind::Processed, 2).await.unwrap();
        m.increment_stat(StatKind::Errored, 1).await.unwrap();
        m.update_stat(StatKind::Pending, 7).await.unwrap();
        m.update_stat(StatKind::Pending, 4).await.unwrap();
        let stats = m.get_global_stats().await.unwrap();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.errored, 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.pending, 4);
    }

    #[tokio::test]
    async fn remove_server_drops_its_records() {
        let m = store();
        let now = Utc::now();
        let (a, b) = (ServerId::from_raw("a"), ServerId::from_raw("b"));
        m.report_heartbeat_at(&a, Duration::ZERO, "v", now).await.unwrap();
        m.report_heartbeat_at(&b, Duration::ZERO, "v", now).await.unwrap();
        m.update_worker_activity(&WorkerActivity::idle(a.clone(), PoolType::Processing, 0, now))
            .await
            .unwrap();
        m.update_worker_activity(&WorkerActivity::idle(b.clone(), PoolType::Processing, 0, now))
            .await
            .unwrap();
        assert_eq!(m.remove_server(&a).await.unwrap(), 2);
        let active = m.get_active_servers_at(now).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(m.get_cluster_activity_at(now).await.unwrap().len(), 1);
    }
}
