//! Channel hibernation.
//!
//! A channel whose conversations have all closed has its socket closed
//! (hibernated) by the transport. A wake loop periodically resumes it for a
//! settle window so queued platform events can arrive, then hibernates again
//! if nothing happened. Inbound activity resumes it immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use relay_core::presence::{ChannelPresence, PresenceUpdate};
use relay_core::session::SessionEntry;
use relay_core::transport::{ConnectionStatus, Transport};
use relay_core::{ChannelId, SessionKey};
use relay_store::{KvStore, StoreError};
use relay_telemetry::MetricsRecorder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Counts the live conversations of a channel.
#[async_trait]
pub trait ActivityProbe: Send + Sync {
    async fn live_sessions(&self, channel: &ChannelId) -> Result<usize, StoreError>;
}

/// Probe backed by the session store.
pub struct SessionCounter {
    sessions: Arc<dyn KvStore<SessionEntry>>,
}

impl SessionCounter {
    pub fn new(sessions: Arc<dyn KvStore<SessionEntry>>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl ActivityProbe for SessionCounter {
    async fn live_sessions(&self, channel: &ChannelId) -> Result<usize, StoreError> {
        let keys = self
            .sessions
            .list(&SessionKey::channel_pattern(channel))
            .await?;
        let mut live = 0;
        for key in keys {
            match self.sessions.get(&key).await {
                Ok(Some(entry)) if entry.state.is_live() => live += 1,
                Ok(_) => {}
                Err(StoreError::Serialization(e)) => {
                    warn!(session_key = %key, error = %e, "unreadable session record not counted");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(live)
    }
}

#[derive(Clone, Debug)]
pub struct PresenceConfig {
    /// How long a hibernating channel sleeps between wake-ups.
    pub wake_period: Duration,
    /// How long a woken channel stays connected before re-checking.
    pub settle_window: Duration,
    /// Store lifetime of presence records, renewed on activity.
    pub record_ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            wake_period: Duration::from_secs(15 * 60),
            settle_window: Duration::from_secs(60),
            record_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Clone, Default)]
struct ChannelSlot {
    /// Serializes hibernate/resume decisions for one channel.
    transition: Arc<tokio::sync::Mutex<()>>,
    /// Bumped by every activity-driven resume.
    epoch: Arc<AtomicU64>,
    wake: Arc<parking_lot::Mutex<Option<CancellationToken>>>,
}

impl ChannelSlot {
    fn cancel_wake(&self) {
        if let Some(token) = self.wake.lock().take() {
            token.cancel();
        }
    }
}

pub struct PresenceManager {
    transport: Arc<dyn Transport>,
    store: Arc<dyn KvStore<ChannelPresence>>,
    probe: Arc<dyn ActivityProbe>,
    config: PresenceConfig,
    metrics: Arc<MetricsRecorder>,
    channels: DashMap<ChannelId, ChannelSlot>,
    shutdown: CancellationToken,
}

impl PresenceManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn KvStore<ChannelPresence>>,
        probe: Arc<dyn ActivityProbe>,
        config: PresenceConfig,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            transport,
            store,
            probe,
            config,
            metrics,
            channels: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn slot(&self, channel: &ChannelId) -> ChannelSlot {
        self.channels.entry(channel.clone()).or_default().clone()
    }

    pub fn is_registered(&self, channel: &ChannelId) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub async fn status(&self, channel: &ChannelId) -> Result<Option<ChannelPresence>, EngineError> {
        Ok(self.store.get(channel.as_str()).await?)
    }

    /// Start the channel's transport and record it as connected.
    pub async fn register(&self, channel: &ChannelId) -> Result<(), EngineError> {
        channel.validate()?;
        let slot = self.slot(channel);
        let _transition = slot.transition.lock().await;
        self.transport.start(channel).await?;
        self.store
            .save(
                channel.as_str(),
                &ChannelPresence::connected(channel.clone(), Utc::now()),
                self.config.record_ttl,
            )
            .await?;
        info!(channel_id = %channel, "channel registered");
        Ok(())
    }

    pub async fn unregister(&self, channel: &ChannelId) -> Result<(), EngineError> {
        let Some((_, slot)) = self.channels.remove(channel) else {
            return Err(EngineError::ChannelNotRegistered(channel.clone()));
        };
        slot.cancel_wake();
        let _transition = slot.transition.lock().await;
        if let Err(e) = self.transport.stop(channel).await {
            warn!(channel_id = %channel, error = %e, "transport stop failed");
        }
        self.store.delete(channel.as_str()).await?;
        info!(channel_id = %channel, "channel unregistered");
        Ok(())
    }

    /// Hibernate the channel if nothing keeps it awake. Returns whether it
    /// was hibernated.
    pub async fn check_idle(self: &Arc<Self>, channel: &ChannelId) -> Result<bool, EngineError> {
        if !self.is_registered(channel) {
            return Ok(false);
        }
        let slot = self.slot(channel);
        let _transition = slot.transition.lock().await;
        if !self.may_hibernate(channel).await? {
            return Ok(false);
        }
        self.hibernate_locked(channel).await?;

        slot.cancel_wake();
        let token = self.shutdown.child_token();
        *slot.wake.lock() = Some(token.clone());
        let epoch = slot.epoch.load(Ordering::SeqCst);
        tokio::spawn(Arc::clone(self).wake_loop(channel.clone(), slot.clone(), epoch, token));
        Ok(true)
    }

    /// Inbound activity on a channel. Resumes it when hibernating and stops
    /// the wake loop from re-hibernating it. Returns whether it was resumed.
    pub async fn on_activity(&self, channel: &ChannelId) -> Result<bool, EngineError> {
        if !self.is_registered(channel) {
            return Err(EngineError::ChannelNotRegistered(channel.clone()));
        }
        let slot = self.slot(channel);
        slot.epoch.fetch_add(1, Ordering::SeqCst);
        slot.cancel_wake();

        let _transition = slot.transition.lock().await;
        let resumed = if self.transport.status(channel) == ConnectionStatus::Hibernating {
            self.resume_locked(channel).await?;
            self.metrics
                .counter_inc("relay_channel_resumes_total", &[("cause", "activity")], 1);
            info!(channel_id = %channel, "channel resumed on activity");
            true
        } else {
            false
        };

        let key = channel.as_str();
        if let Err(e) = self
            .store
            .update_field(key, PresenceUpdate::Touch(Utc::now()))
            .await
        {
            warn!(channel_id = %channel, error = %e, "presence touch failed");
        } else if let Err(e) = self.store.extend(key, self.config.record_ttl).await {
            warn!(channel_id = %channel, error = %e, "presence ttl renewal failed");
        }
        Ok(resumed)
    }

    /// Stop every wake loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn may_hibernate(&self, channel: &ChannelId) -> Result<bool, EngineError> {
        if self.transport.status(channel) != ConnectionStatus::Connected {
            return Ok(false);
        }
        let live = self.probe.live_sessions(channel).await?;
        if live > 0 {
            debug!(channel_id = %channel, live, "channel has live sessions, staying connected");
            return Ok(false);
        }
        Ok(true)
    }

    async fn hibernate_locked(&self, channel: &ChannelId) -> Result<(), EngineError> {
        self.transport.hibernate(channel).await?;
        self.record_state(channel, ConnectionStatus::Hibernating).await;
        self.metrics
            .counter_inc("relay_channel_hibernations_total", &[], 1);
        info!(channel_id = %channel, "channel hibernated");
        Ok(())
    }

    async fn resume_locked(&self, channel: &ChannelId) -> Result<(), EngineError> {
        self.transport.resume(channel).await?;
        self.record_state(channel, ConnectionStatus::Connected).await;
        Ok(())
    }

    async fn record_state(&self, channel: &ChannelId, state: ConnectionStatus) {
        let update = PresenceUpdate::State {
            state,
            at: Utc::now(),
        };
        if let Err(e) = self.store.update_field(channel.as_str(), update).await {
            warn!(channel_id = %channel, error = %e, %state, "presence update failed");
        }
    }

    async fn wake_loop(
        self: Arc<Self>,
        channel: ChannelId,
        slot: ChannelSlot,
        epoch: u64,
        cancel: CancellationToken,
    ) {
        let woken = |slot: &ChannelSlot| slot.epoch.load(Ordering::SeqCst) != epoch;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.wake_period) => {}
            }
            {
                let _transition = slot.transition.lock().await;
                if cancel.is_cancelled() || woken(&slot) {
                    return;
                }
                if let Err(e) = self.resume_locked(&channel).await {
                    warn!(channel_id = %channel, error = %e, "wake-up resume failed");
                    return;
                }
                self.metrics
                    .counter_inc("relay_channel_resumes_total", &[("cause", "wake")], 1);
                debug!(channel_id = %channel, "channel woken for settle window");
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.settle_window) => {}
            }

            let _transition = slot.transition.lock().await;
            if cancel.is_cancelled() || woken(&slot) {
                return;
            }
            match self.may_hibernate(&channel).await {
                Ok(true) => {
                    if let Err(e) = self.hibernate_locked(&channel).await {
                        warn!(channel_id = %channel, error = %e, "re-hibernation failed");
                        return;
                    }
                }
                Ok(false) => {
                    info!(channel_id = %channel, "channel stays connected after wake-up");
                    return;
                }
                Err(e) => {
                    warn!(channel_id = %channel, error = %e, "idle re-check failed, staying connected");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use relay_core::mock::MockTransport;
    use relay_core::session::{SessionState, SessionUpdate};
    use relay_store::{
        CacheBackend, ClusterStore, DistributedLock, Keyspace, LockConfig, MemoryCache,
        MemoryStore,
    };
    use std::collections::HashMap;

    #[derive(Default)]
    struct FixedProbe {
        live: Mutex<HashMap<ChannelId, usize>>,
    }

    impl FixedProbe {
        fn set(&self, channel: &ChannelId, n: usize) {
            self.live.lock().insert(channel.clone(), n);
        }
    }

    #[async_trait]
    impl ActivityProbe for FixedProbe {
        async fn live_sessions(&self, channel: &ChannelId) -> Result<usize, StoreError> {
            Ok(self.live.lock().get(channel).copied().unwrap_or(0))
        }
    }

    struct Fixture {
        transport: Arc<MockTransport>,
        probe: Arc<FixedProbe>,
        store: Arc<MemoryStore<ChannelPresence>>,
        presence: Arc<PresenceManager>,
        channel: ChannelId,
    }

    async fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let probe = Arc::new(FixedProbe::default());
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(PresenceManager::new(
            transport.clone(),
            store.clone(),
            probe.clone(),
            PresenceConfig {
                wake_period: Duration::from_secs(900),
                settle_window: Duration::from_secs(60),
                record_ttl: Duration::from_secs(3600),
            },
            Arc::new(MetricsRecorder::new()),
        ));
        let channel = ChannelId::from_raw("chanA");
        presence.register(&channel).await.unwrap();
        Fixture {
            transport,
            probe,
            store,
            presence,
            channel,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn register_records_connected() {
        let f = fixture().await;
        let record = f.presence.status(&f.channel).await.unwrap().unwrap();
        assert_eq!(record.state, ConnectionStatus::Connected);
        assert!(record.is_socket_connected);
        assert_eq!(f.transport.status(&f.channel), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn register_rejects_channel_with_key_separator() {
        let f = fixture().await;
        let bad = ChannelId::from_raw("chan|B");
        let err = f.presence.register(&bad).await.unwrap_err();
        assert_eq!(err.error_kind(), "invalid_channel");
        assert_eq!(f.transport.status(&bad), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn live_session_blocks_hibernation() {
        let f = fixture().await;
        f.probe.set(&f.channel, 1);
        assert!(!f.presence.check_idle(&f.channel).await.unwrap());
        assert_eq!(f.transport.hibernate_count(&f.channel), 0);
        assert_eq!(f.transport.status(&f.channel), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_channel_hibernates() {
        let f = fixture().await;
        assert!(f.presence.check_idle(&f.channel).await.unwrap());
        assert_eq!(f.transport.status(&f.channel), ConnectionStatus::Hibernating);
        let record = f.store.get(f.channel.as_str()).await.unwrap().unwrap();
        assert_eq!(record.state, ConnectionStatus::Hibernating);
        assert!(record.hibernated_at.is_some());
        assert!(!record.is_socket_connected);
        // Already hibernating: a second check is a no-op.
        assert!(!f.presence.check_idle(&f.channel).await.unwrap());
        assert_eq!(f.transport.hibernate_count(&f.channel), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resumes_hibernating_channel() {
        let f = fixture().await;
        f.presence.check_idle(&f.channel).await.unwrap();
        assert!(f.presence.on_activity(&f.channel).await.unwrap());
        assert_eq!(f.transport.status(&f.channel), ConnectionStatus::Connected);
        assert!(!f.presence.on_activity(&f.channel).await.unwrap());
        assert_eq!(f.transport.resume_count(&f.channel), 1);

        // The cancelled wake loop never fires.
        tokio::time::sleep(Duration::from_secs(2000)).await;
        assert_eq!(f.transport.hibernate_count(&f.channel), 1);
        assert_eq!(f.transport.resume_count(&f.channel), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wake_loop_resumes_then_rehibernates_when_idle() {
        let f = fixture().await;
        f.presence.check_idle(&f.channel).await.unwrap();

        tokio::time::sleep(Duration::from_secs(901)).await;
        assert_eq!(f.transport.resume_count(&f.channel), 1);
        assert_eq!(f.transport.status(&f.channel), ConnectionStatus::Connected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.transport.hibernate_count(&f.channel), 2);
        assert_eq!(f.transport.status(&f.channel), ConnectionStatus::Hibernating);

        // And again on the next period.
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(f.transport.resume_count(&f.channel), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wake_loop_stays_connected_when_session_appears() {
        let f = fixture().await;
        f.presence.check_idle(&f.channel).await.unwrap();
        tokio::time::sleep(Duration::from_secs(901)).await;
        f.probe.set(&f.channel, 1);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.transport.hibernate_count(&f.channel), 1);
        assert_eq!(f.transport.status(&f.channel), ConnectionStatus::Connected);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(f.transport.resume_count(&f.channel), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_resume_during_settle_prevents_rehibernation() {
        let f = fixture().await;
        f.presence.check_idle(&f.channel).await.unwrap();
        tokio::time::sleep(Duration::from_secs(910)).await;
        // Activity while already connected by the wake loop.
        assert!(!f.presence.on_activity(&f.channel).await.unwrap());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.transport.hibernate_count(&f.channel), 1);
        assert_eq!(f.transport.status(&f.channel), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_stops_everything() {
        let f = fixture().await;
        f.presence.check_idle(&f.channel).await.unwrap();
        f.presence.unregister(&f.channel).await.unwrap();
        assert!(f.presence.status(&f.channel).await.unwrap().is_none());
        assert!(!f.presence.is_registered(&f.channel));
        tokio::time::sleep(Duration::from_secs(2000)).await;
        assert_eq!(f.transport.resume_count(&f.channel), 0);
        assert!(matches!(
            f.presence.on_activity(&f.channel).await,
            Err(EngineError::ChannelNotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn session_counter_ignores_closed_and_other_channels() {
        let sessions = Arc::new(MemoryStore::<SessionEntry>::new());
        let ttl = Duration::from_secs(60);
        let now = Utc::now();
        let live = SessionKey::new("a".into(), "1".into());
        let mut closed = SessionEntry::new(SessionKey::new("a".into(), "2".into()), now);
        closed.state = SessionState::Closed;
        let other = SessionKey::new("b".into(), "1".into());
        sessions
            .save(&live.to_string(), &SessionEntry::new(live.clone(), now), ttl)
            .await
            .unwrap();
        sessions.save("a|2", &closed, ttl).await.unwrap();
        sessions
            .save(&other.to_string(), &SessionEntry::new(other.clone(), now), ttl)
            .await
            .unwrap();
        let counter = SessionCounter::new(sessions);
        assert_eq!(counter.live_sessions(&"a".into()).await.unwrap(), 1);
        assert_eq!(counter.live_sessions(&"c".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn session_counter_skips_held_locks_on_cluster_store() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
        let lock = DistributedLock::new(Arc::clone(&backend), LockConfig::default());
        let sessions = Arc::new(ClusterStore::<SessionEntry>::new(
            Arc::clone(&backend),
            &Keyspace::new("t"),
            lock.clone(),
        ));
        let key = SessionKey::new("chanA".into(), "chat1".into());
        sessions
            .save(
                &key.to_string(),
                &SessionEntry::new(key.clone(), Utc::now()),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        sessions
            .update_field(&key.to_string(), SessionUpdate::State(SessionState::Closed))
            .await
            .unwrap();

        let guard = lock
            .acquire("t:session:chanA|chat1", &CancellationToken::new())
            .await
            .unwrap();
        let counter = SessionCounter::new(sessions);
        assert_eq!(counter.live_sessions(&"chanA".into()).await.unwrap(), 0);
        guard.release().await.unwrap();
    }
}
