use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ServerId, SessionKey};

/// Liveness report of one server instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: ServerId,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub uptime_secs: u64,
    pub version: String,
}

/// Worker pools that report activity.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    /// Settled bursts handed to the reply engine.
    Processing,
    /// Outbound notices (inactivity warnings, close notices).
    Outbound,
}

impl PoolType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Outbound => "outbound",
        }
    }
}

impl std::fmt::Display for PoolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one worker is doing right now.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerActivity {
    pub server_id: ServerId,
    pub pool: PoolType,
    pub worker_id: u32,
    pub is_processing: bool,
    pub chat_key: Option<SessionKey>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerActivity {
    pub fn busy(
        server_id: ServerId,
        pool: PoolType,
        worker_id: u32,
        chat_key: SessionKey,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            server_id,
            pool,
            worker_id,
            is_processing: true,
            chat_key: Some(chat_key),
            started_at: Some(now),
            updated_at: now,
        }
    }

    pub fn idle(server_id: ServerId, pool: PoolType, worker_id: u32, now: DateTime<Utc>) -> Self {
        Self {
            server_id,
            pool,
            worker_id,
            is_processing: false,
            chat_key: None,
            started_at: None,
            updated_at: now,
        }
    }
}

/// Cluster-wide counters and gauges.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    Processed,
    Errored,
    Dropped,
    Pending,
}

impl StatKind {
    pub const ALL: [StatKind; 4] = [
        StatKind::Processed,
        StatKind::Errored,
        StatKind::Dropped,
        StatKind::Pending,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Errored => "errored",
            Self::Dropped => "dropped",
            Self::Pending => "pending",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub processed: i64,
    pub errored: i64,
    pub dropped: i64,
    pub pending: i64,
}

impl GlobalStats {
    pub fn set(&mut self, kind: StatKind, value: i64) {
        match kind {
            StatKind::Processed => self.processed = value,
            StatKind::Errored => self.errored = value,
            StatKind::Dropped => self.dropped = value,
            StatKind::Pending => self.pending = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_stats_set_by_kind() {
        let mut stats = GlobalStats::default();
        for (i, kind) in StatKind::ALL.into_iter().enumerate() {
            stats.set(kind, i as i64 + 1);
        }
        assert_eq!(
            stats,
            GlobalStats {
                processed: 1,
                errored: 2,
                dropped: 3,
                pending: 4
            }
        );
    }

    #[test]
    fn worker_activity_constructors() {
        let now = Utc::now();
        let key = SessionKey::new("c".into(), "u".into());
        let busy = WorkerActivity::busy(ServerId::new(), PoolType::Processing, 3, key.clone(), now);
        assert!(busy.is_processing);
        assert_eq!(busy.chat_key, Some(key));
        let idle = WorkerActivity::idle(ServerId::new(), PoolType::Outbound, 1, now);
        assert!(!idle.is_processing);
        assert!(idle.started_at.is_none());
    }

    #[test]
    fn pool_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&PoolType::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(PoolType::Outbound.to_string(), "outbound");
    }
}
