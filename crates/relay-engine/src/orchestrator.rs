//! Session orchestrator: per-conversation debounce and lifecycle.
//!
//! Inbound messages of one conversation are collected into a burst until the
//! conversation has been quiet for the debounce window. The burst is handed
//! to [`SessionHooks::process`] exactly once, after which the session waits
//! for the next message. A session that stays quiet gets an inactivity
//! warning and is then closed.
//!
//! ```text
//! Debouncing --quiet--> Processing --done--> Waiting --timeout--> Closed
//!     ^                                         |
//!     +-------------- new message --------------+
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_core::events::{ActivityEvent, ActivityKind, InboundMessage};
use relay_core::session::{SessionEntry, SessionState, SessionUpdate};
use relay_core::{ChannelId, SessionKey};
use relay_store::{KvStore, TypingStore};
use relay_telemetry::MetricsRecorder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineError;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Quiet period that ends a burst.
    pub debounce: Duration,
    /// Quiet period after a reply that closes the session.
    pub inactivity_timeout: Duration,
    /// How long before the close the warning fires. Zero disables it.
    pub warn_offset: Duration,
    /// Store lifetime of a session entry, renewed by every message.
    pub session_ttl: Duration,
    /// How many times an expiring debounce may wait for a typing user.
    pub max_typing_deferrals: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(3),
            inactivity_timeout: Duration::from_secs(600),
            warn_offset: Duration::from_secs(60),
            session_ttl: Duration::from_secs(1800),
            max_typing_deferrals: 3,
        }
    }
}

/// What the processing hook decided about the session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub close_session: bool,
}

impl ProcessOutcome {
    pub fn close() -> Self {
        Self {
            close_session: true,
        }
    }
}

/// Callbacks the orchestrator drives. Injected at construction.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Handle one settled burst. Called at most once at a time per session.
    async fn process(
        &self,
        key: &SessionKey,
        burst: Vec<InboundMessage>,
        cancel: CancellationToken,
    ) -> ProcessOutcome;

    async fn inactivity_warning(&self, key: &SessionKey);

    /// Remove files the session downloaded. Runs before the entry is deleted.
    async fn cleanup_files(&self, key: &SessionKey, files: &[PathBuf]);

    /// The channel may have lost its last live session.
    async fn channel_idle(&self, channel: &ChannelId);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseReason {
    Inactive,
    Requested,
    Forced,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Requested => "requested",
            Self::Forced => "forced",
        }
    }
}

#[derive(Default)]
struct SlotState {
    pending: Vec<InboundMessage>,
    /// Bumped by every inbound message; stale timers compare against it.
    generation: u64,
    /// The armed debounce or inactivity timer.
    timer: Option<CancellationToken>,
    deferrals: u32,
    closed: bool,
}

#[derive(Default)]
struct Slot {
    state: parking_lot::Mutex<SlotState>,
    /// Held while a burst of this session is being processed.
    run: tokio::sync::Mutex<()>,
}

impl Slot {
    fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        !state.closed && state.generation == generation
    }
}

pub struct SessionOrchestrator {
    sessions: Arc<dyn KvStore<SessionEntry>>,
    hooks: Arc<dyn SessionHooks>,
    typing: Option<TypingStore>,
    config: OrchestratorConfig,
    metrics: Arc<MetricsRecorder>,
    slots: DashMap<SessionKey, Arc<Slot>>,
    /// Sessions being closed; the token fires once the close is done.
    closing: DashMap<SessionKey, CancellationToken>,
    shutdown: CancellationToken,
}

impl SessionOrchestrator {
    pub fn new(
        sessions: Arc<dyn KvStore<SessionEntry>>,
        hooks: Arc<dyn SessionHooks>,
        typing: Option<TypingStore>,
        config: OrchestratorConfig,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            sessions,
            hooks,
            typing,
            config,
            metrics,
            slots: DashMap::new(),
            closing: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Sessions with local timers or a pending burst in this process.
    pub fn tracked(&self) -> usize {
        self.slots.len()
    }

    /// The slot of `key`, or the token of the close in progress.
    fn open_slot(&self, key: &SessionKey) -> Result<Arc<Slot>, CancellationToken> {
        let entry = self.slots.entry(key.clone());
        if let Some(done) = self.closing.get(key) {
            return Err(done.value().clone());
        }
        Ok(Arc::clone(&entry.or_default()))
    }

    /// Add a message to its session's burst and restart the debounce timer.
    pub async fn handle_inbound(self: &Arc<Self>, message: InboundMessage) {
        if self.shutdown.is_cancelled() {
            debug!(message_id = %message.message_id, "orchestrator stopped, ignoring message");
            return;
        }
        let key = message.session_key();
        let mut message = Some(message);
        let (slot, generation, timer) = loop {
            let slot = match self.open_slot(&key) {
                Ok(slot) => slot,
                Err(done) => {
                    debug!(session_key = %key, "session closing, holding message");
                    done.cancelled().await;
                    continue;
                }
            };
            let mut state = slot.state.lock();
            if state.closed {
                // Closed between lookup and lock; the next slot is fresh.
                continue;
            }
            state.pending.extend(message.take());
            if let Some(previous) = state.timer.take() {
                previous.cancel();
            }
            state.generation += 1;
            state.deferrals = 0;
            let timer = self.shutdown.child_token();
            state.timer = Some(timer.clone());
            let generation = state.generation;
            drop(state);
            break (slot, generation, timer);
        };

        self.touch_entry(&key).await;

        tokio::spawn(Arc::clone(self).run_debounce(key, slot, generation, timer));
    }

    /// Create the entry on the first message of a session, otherwise mark it
    /// as debouncing again and renew its TTL. A closed entry counts as absent.
    async fn touch_entry(&self, key: &SessionKey) {
        let store_key = key.to_string();
        let now = Utc::now();
        let live = match self.sessions.get(&store_key).await {
            Ok(entry) => entry.is_some_and(|e| e.state.is_live()),
            Err(e) => {
                warn!(session_key = %key, error = %e, "session lookup failed");
                return;
            }
        };
        let touched = if live {
            self.sessions
                .update_field(&store_key, SessionUpdate::Touch { at: now })
                .await
        } else {
            Ok(false)
        };
        match touched {
            Ok(true) => {
                if let Err(e) = self.sessions.extend(&store_key, self.config.session_ttl).await {
                    warn!(session_key = %key, error = %e, "session ttl renewal failed");
                }
            }
            Ok(false) => {
                let mut entry = SessionEntry::new(key.clone(), now);
                entry.focus_score = 1;
                match self
                    .sessions
                    .save(&store_key, &entry, self.config.session_ttl)
                    .await
                {
                    Ok(()) => {
                        self.metrics.counter_inc("relay_sessions_opened_total", &[], 1);
                        info!(session_key = %key, "session opened");
                    }
                    Err(e) => warn!(session_key = %key, error = %e, "session create failed"),
                }
            }
            Err(e) => warn!(session_key = %key, error = %e, "session update failed"),
        }
    }

    async fn update(&self, key: &SessionKey, update: SessionUpdate) -> bool {
        match self.sessions.update_field(&key.to_string(), update).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!(session_key = %key, error = %e, "session update failed");
                false
            }
        }
    }

    async fn user_is_typing(&self, key: &SessionKey) -> bool {
        let Some(typing) = &self.typing else {
            return false;
        };
        match typing.is_typing(&key.channel_id, &key.chat_id).await {
            Ok(typing) => typing,
            Err(e) => {
                debug!(session_key = %key, error = %e, "typing lookup failed");
                false
            }
        }
    }

    async fn run_debounce(
        self: Arc<Self>,
        key: SessionKey,
        slot: Arc<Slot>,
        generation: u64,
        timer: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep(self.config.debounce) => {}
            }
            if !self.user_is_typing(&key).await {
                break;
            }
            let defer = {
                let mut state = slot.state.lock();
                if state.generation != generation || state.closed {
                    return;
                }
                if state.deferrals < self.config.max_typing_deferrals {
                    state.deferrals += 1;
                    true
                } else {
                    false
                }
            };
            if !defer {
                break;
            }
            self.metrics.counter_inc("relay_typing_deferrals_total", &[], 1);
            debug!(session_key = %key, "user still typing, deferring burst");
        }
        self.process_burst(key, slot, generation).await;
    }

    async fn process_burst(self: Arc<Self>, key: SessionKey, slot: Arc<Slot>, generation: u64) {
        let _run = slot.run.lock().await;
        let burst = {
            let mut state = slot.state.lock();
            if state.generation != generation || state.closed {
                // A newer timer owns the pending messages.
                return;
            }
            state.timer = None;
            std::mem::take(&mut state.pending)
        };
        if burst.is_empty() {
            return;
        }

        self.update(&key, SessionUpdate::State(SessionState::Processing)).await;
        self.update(&key, SessionUpdate::FocusScore(0)).await;
        let size = burst.len();
        debug!(session_key = %key, size, "processing burst");
        self.metrics.counter_inc("relay_bursts_processed_total", &[], 1);
        self.metrics
            .histogram_observe("relay_burst_size", &[], size as f64);

        let outcome = self
            .hooks
            .process(&key, burst, self.shutdown.child_token())
            .await;

        if outcome.close_session {
            self.close(&key, CloseReason::Requested, None).await;
            return;
        }
        if !slot.is_current(generation) {
            // New input arrived meanwhile; the entry is already debouncing.
            return;
        }

        self.update(&key, SessionUpdate::State(SessionState::Waiting)).await;
        let timer = {
            let mut state = slot.state.lock();
            if state.closed || state.generation != generation {
                None
            } else {
                let timer = self.shutdown.child_token();
                state.timer = Some(timer.clone());
                Some(timer)
            }
        };
        match timer {
            Some(timer) => {
                let task =
                    Arc::clone(&self).run_inactivity(key, Arc::clone(&slot), generation, timer);
                tokio::spawn(task);
            }
            None => {
                self.update(&key, SessionUpdate::State(SessionState::Debouncing)).await;
            }
        }
    }

    async fn run_inactivity(
        self: Arc<Self>,
        key: SessionKey,
        slot: Arc<Slot>,
        generation: u64,
        timer: CancellationToken,
    ) {
        let timeout = self.config.inactivity_timeout;
        let offset = self.config.warn_offset;
        let (first_wait, warn) = if !offset.is_zero() && offset < timeout {
            (timeout - offset, true)
        } else {
            (timeout, false)
        };

        tokio::select! {
            _ = timer.cancelled() => return,
            _ = tokio::time::sleep(first_wait) => {}
        }
        if warn {
            if !slot.is_current(generation) {
                return;
            }
            debug!(session_key = %key, "inactivity warning");
            self.hooks.inactivity_warning(&key).await;
            tokio::select! {
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep(offset) => {}
            }
        }
        self.close(&key, CloseReason::Inactive, Some(generation)).await;
    }

    /// Close a session: mark it closed, clean up its files, delete the entry
    /// and let the channel go idle. Returns `false` when there was nothing to
    /// close.
    ///
    /// With `expected` set, the close is skipped if a message arrived after
    /// that generation.
    async fn close(&self, key: &SessionKey, reason: CloseReason, expected: Option<u64>) -> bool {
        let done = CancellationToken::new();
        {
            let slot = self.slots.entry(key.clone());
            if self.closing.contains_key(key) {
                return false;
            }
            if let (Some(generation), Entry::Occupied(occupied)) = (expected, &slot) {
                if !occupied.get().is_current(generation) {
                    return false;
                }
            }
            self.closing.insert(key.clone(), done.clone());
            if let Entry::Occupied(occupied) = slot {
                let slot = occupied.remove();
                let mut state = slot.state.lock();
                state.closed = true;
                state.pending.clear();
                if let Some(timer) = state.timer.take() {
                    timer.cancel();
                }
            }
        }
        let closed = self.close_inner(key, reason).await;
        self.closing.remove(key);
        done.cancel();
        closed
    }

    async fn close_inner(&self, key: &SessionKey, reason: CloseReason) -> bool {
        let store_key = key.to_string();
        let entry = match self.sessions.get(&store_key).await {
            Ok(Some(entry)) if entry.state.is_live() => entry,
            Ok(_) => return false,
            Err(e) => {
                warn!(session_key = %key, error = %e, "session lookup failed during close");
                return false;
            }
        };

        if !self.update(key, SessionUpdate::State(SessionState::Closed)).await {
            return false;
        }
        self.hooks.cleanup_files(key, &entry.files).await;
        if let Err(e) = self.sessions.delete(&store_key).await {
            warn!(session_key = %key, error = %e, "session delete failed");
        }
        self.hooks.channel_idle(&key.channel_id).await;

        self.metrics
            .counter_inc("relay_sessions_closed_total", &[("reason", reason.as_str())], 1);
        info!(session_key = %key, reason = reason.as_str(), "session closed");
        true
    }

    /// Close a session now. Closing an absent or already closed session
    /// returns `false`.
    pub async fn force_close(&self, key: &SessionKey) -> bool {
        self.close(key, CloseReason::Forced, None).await
    }

    /// Apply a non-message transport event (typing, chat opened/closed).
    pub async fn note_activity(&self, event: &ActivityEvent) {
        let Some(key) = event.session_key() else {
            return;
        };
        match &event.kind {
            ActivityKind::Composing { media } => {
                if let Some(typing) = &self.typing {
                    if let Err(e) = typing.set_typing(&key.channel_id, &key.chat_id, *media).await {
                        debug!(session_key = %key, error = %e, "typing update failed");
                    }
                }
            }
            ActivityKind::Paused => {
                if let Some(typing) = &self.typing {
                    if let Err(e) = typing.clear(&key.channel_id, &key.chat_id).await {
                        debug!(session_key = %key, error = %e, "typing clear failed");
                    }
                }
            }
            ActivityKind::ChatOpened => {
                self.update(&key, SessionUpdate::ChatOpen(true)).await;
            }
            ActivityKind::ChatClosed => {
                self.update(&key, SessionUpdate::ChatOpen(false)).await;
            }
            ActivityKind::Online => {}
        }
    }

    pub async fn get(&self, key: &SessionKey) -> Result<Option<SessionEntry>, EngineError> {
        Ok(self.sessions.get(&key.to_string()).await?)
    }

    /// Every live session in the store, across all processes.
    pub async fn list_active(&self) -> Result<Vec<SessionEntry>, EngineError> {
        let mut entries: Vec<SessionEntry> = self
            .sessions
            .get_all()
            .await?
            .into_values()
            .filter(|e| e.state.is_live())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Cancel every timer. Stored entries are left to expire.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.slots.clear();
        info!("session orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use relay_core::events::MediaKind;
    use relay_store::{MemoryStore, TypingConfig};

    #[derive(Clone, Debug, PartialEq)]
    enum HookCall {
        Process(SessionKey, Vec<String>),
        Warning(SessionKey),
        Cleanup(SessionKey, Vec<PathBuf>),
        Idle(ChannelId),
    }

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<HookCall>>,
        close_next: Mutex<bool>,
        process_delay: Mutex<Option<Duration>>,
        /// When set, file cleanup blocks until notified.
        cleanup_gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
    }

    impl RecordingHooks {
        fn calls(&self) -> Vec<HookCall> {
            self.calls.lock().clone()
        }

        fn processed(&self) -> Vec<Vec<String>> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    HookCall::Process(_, texts) => Some(texts),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, pred: impl Fn(&HookCall) -> bool) -> usize {
            self.calls.lock().iter().filter(|c| pred(c)).count()
        }
    }

    #[async_trait]
    impl SessionHooks for RecordingHooks {
        async fn process(
            &self,
            key: &SessionKey,
            burst: Vec<InboundMessage>,
            _cancel: CancellationToken,
        ) -> ProcessOutcome {
            let texts = burst.into_iter().map(|m| m.text).collect();
            self.calls.lock().push(HookCall::Process(key.clone(), texts));
            let delay = self.process_delay.lock().take();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let close = std::mem::take(&mut *self.close_next.lock());
            ProcessOutcome {
                close_session: close,
            }
        }

        async fn inactivity_warning(&self, key: &SessionKey) {
            self.calls.lock().push(HookCall::Warning(key.clone()));
        }

        async fn cleanup_files(&self, key: &SessionKey, files: &[PathBuf]) {
            self.calls
                .lock()
                .push(HookCall::Cleanup(key.clone(), files.to_vec()));
            let gate = self.cleanup_gate.lock().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
        }

        async fn channel_idle(&self, channel: &ChannelId) {
            self.calls.lock().push(HookCall::Idle(channel.clone()));
        }
    }

    struct Fixture {
        orchestrator: Arc<SessionOrchestrator>,
        hooks: Arc<RecordingHooks>,
        sessions: Arc<MemoryStore<SessionEntry>>,
        typing: TypingStore,
    }

    fn fixture(config: OrchestratorConfig) -> Fixture {
        let hooks = Arc::new(RecordingHooks::default());
        let sessions = Arc::new(MemoryStore::new());
        let typing = TypingStore::new(Arc::new(MemoryStore::new()), TypingConfig::default());
        let orchestrator = Arc::new(SessionOrchestrator::new(
            sessions.clone(),
            hooks.clone(),
            Some(typing.clone()),
            config,
            Arc::new(MetricsRecorder::new()),
        ));
        Fixture {
            orchestrator,
            hooks,
            sessions,
            typing,
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            debounce: Duration::from_secs(3),
            inactivity_timeout: Duration::from_secs(600),
            warn_offset: Duration::from_secs(60),
            session_ttl: Duration::from_secs(1800),
            max_typing_deferrals: 2,
        }
    }

    fn msg(text: &str) -> InboundMessage {
        InboundMessage::text("chanA", "chat1", "user1", text)
    }

    fn key() -> SessionKey {
        SessionKey::new("chanA".into(), "chat1".into())
    }

    async fn stored(f: &Fixture) -> Option<SessionEntry> {
        f.sessions.get(&key().to_string()).await.unwrap()
    }

    async fn secs(n: u64) {
        tokio::time::sleep(Duration::from_secs(n)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn quick_messages_coalesce_into_one_burst() {
        let f = fixture(config());
        f.orchestrator.handle_inbound(msg("a")).await;
        secs(1).await;
        f.orchestrator.handle_inbound(msg("b")).await;
        secs(1).await;
        f.orchestrator.handle_inbound(msg("c")).await;

        let entry = stored(&f).await.unwrap();
        assert_eq!(entry.state, SessionState::Debouncing);
        assert_eq!(entry.focus_score, 3);

        secs(2).await;
        assert!(f.hooks.processed().is_empty());
        secs(2).await;
        assert_eq!(f.hooks.processed(), vec![vec!["a", "b", "c"]]);

        let entry = stored(&f).await.unwrap();
        assert_eq!(entry.state, SessionState::Waiting);
        assert_eq!(entry.focus_score, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_messages_are_processed_separately() {
        let f = fixture(config());
        f.orchestrator.handle_inbound(msg("a")).await;
        secs(4).await;
        f.orchestrator.handle_inbound(msg("b")).await;
        secs(4).await;
        assert_eq!(f.hooks.processed(), vec![vec!["a"], vec!["b"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_warns_then_closes() {
        let f = fixture(config());
        f.orchestrator.handle_inbound(msg("hi")).await;
        secs(4).await;
        assert_eq!(f.hooks.processed().len(), 1);

        // Reply done at t=3; warning at t=543, close at t=603.
        secs(538).await;
        assert_eq!(f.hooks.count(|c| matches!(c, HookCall::Warning(_))), 0);
        secs(2).await;
        assert_eq!(f.hooks.count(|c| matches!(c, HookCall::Warning(_))), 1);
        assert!(stored(&f).await.is_some());

        secs(60).await;
        assert!(stored(&f).await.is_none());
        let calls = f.hooks.calls();
        let tail: Vec<_> = calls.iter().rev().take(2).rev().cloned().collect();
        assert_eq!(
            tail,
            vec![
                HookCall::Cleanup(key(), Vec::new()),
                HookCall::Idle(ChannelId::from_raw("chanA")),
            ]
        );
        assert_eq!(f.orchestrator.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_offset_skips_warning() {
        let mut cfg = config();
        cfg.warn_offset = Duration::ZERO;
        let f = fixture(cfg);
        f.orchestrator.handle_inbound(msg("hi")).await;
        secs(700).await;
        assert_eq!(f.hooks.count(|c| matches!(c, HookCall::Warning(_))), 0);
        assert!(stored(&f).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn message_while_waiting_cancels_inactivity() {
        let f = fixture(config());
        f.orchestrator.handle_inbound(msg("one")).await;
        secs(500).await;
        f.orchestrator.handle_inbound(msg("two")).await;
        assert_eq!(stored(&f).await.unwrap().state, SessionState::Debouncing);
        // The first inactivity deadline (t=603) passes without a close.
        secs(200).await;
        assert!(stored(&f).await.is_some());
        assert_eq!(f.hooks.count(|c| matches!(c, HookCall::Warning(_))), 0);
        assert_eq!(f.hooks.processed().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_signal_from_processing_closes_session() {
        let f = fixture(config());
        *f.hooks.close_next.lock() = true;
        f.orchestrator.handle_inbound(msg("bye")).await;
        secs(4).await;
        assert!(stored(&f).await.is_none());
        assert_eq!(f.hooks.count(|c| matches!(c, HookCall::Idle(_))), 1);
        // No inactivity timer left behind.
        secs(700).await;
        assert_eq!(f.hooks.count(|c| matches!(c, HookCall::Warning(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn force_close_is_idempotent() {
        let f = fixture(config());
        f.orchestrator.handle_inbound(msg("hi")).await;
        assert!(f.orchestrator.force_close(&key()).await);
        assert!(!f.orchestrator.force_close(&key()).await);
        assert!(!f
            .orchestrator
            .force_close(&SessionKey::new("x".into(), "y".into()))
            .await);
        // The pending burst was discarded with the session.
        secs(10).await;
        assert!(f.hooks.processed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_defers_processing_up_to_limit() {
        let f = fixture(config());
        let k = key();
        f.typing
            .set_typing(&k.channel_id, &k.chat_id, MediaKind::Text)
            .await
            .unwrap();
        f.orchestrator.handle_inbound(msg("a")).await;
        // Deferred twice (t=3, t=6), processed at t=9 despite typing.
        secs(8).await;
        assert!(f.hooks.processed().is_empty());
        secs(2).await;
        assert_eq!(f.hooks.processed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn message_during_processing_starts_new_burst() {
        let f = fixture(config());
        // The first burst takes 5s (t=3..8).
        *f.hooks.process_delay.lock() = Some(Duration::from_secs(5));
        f.orchestrator.handle_inbound(msg("a")).await;
        secs(4).await;
        assert_eq!(stored(&f).await.unwrap().state, SessionState::Processing);
        f.orchestrator.handle_inbound(msg("b")).await;
        assert_eq!(stored(&f).await.unwrap().state, SessionState::Debouncing);
        secs(2).await;
        assert_eq!(f.hooks.processed().len(), 1);
        secs(10).await;
        assert_eq!(f.hooks.processed(), vec![vec!["a"], vec!["b"]]);
        assert_eq!(stored(&f).await.unwrap().state, SessionState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_events_update_entry_and_typing() {
        let f = fixture(config());
        f.orchestrator.handle_inbound(msg("a")).await;
        let k = key();
        f.orchestrator
            .note_activity(&ActivityEvent::new(
                "chanA",
                Some("chat1".into()),
                ActivityKind::ChatClosed,
            ))
            .await;
        assert!(!stored(&f).await.unwrap().chat_open);
        f.orchestrator
            .note_activity(&ActivityEvent::new(
                "chanA",
                Some("chat1".into()),
                ActivityKind::Composing {
                    media: MediaKind::Audio,
                },
            ))
            .await;
        assert!(f.typing.is_typing(&k.channel_id, &k.chat_id).await.unwrap());
        f.orchestrator
            .note_activity(&ActivityEvent::new("chanA", Some("chat1".into()), ActivityKind::Paused))
            .await;
        assert!(!f.typing.is_typing(&k.channel_id, &k.chat_id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn list_active_and_shutdown() {
        let f = fixture(config());
        f.orchestrator.handle_inbound(msg("a")).await;
        f.orchestrator
            .handle_inbound(InboundMessage::text("chanA", "chat2", "u2", "b"))
            .await;
        let active = f.orchestrator.list_active().await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(f.orchestrator.get(&key()).await.unwrap().is_some());

        f.orchestrator.shutdown();
        secs(10).await;
        assert!(f.hooks.processed().is_empty());
        f.orchestrator.handle_inbound(msg("late")).await;
        assert_eq!(f.orchestrator.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn message_during_close_opens_a_fresh_session() {
        let f = fixture(config());
        f.orchestrator.handle_inbound(msg("a")).await;
        secs(4).await;
        assert_eq!(f.hooks.processed().len(), 1);

        let gate = Arc::new(tokio::sync::Notify::new());
        *f.hooks.cleanup_gate.lock() = Some(Arc::clone(&gate));
        let closing = {
            let o = Arc::clone(&f.orchestrator);
            tokio::spawn(async move { o.force_close(&key()).await })
        };
        secs(1).await;
        assert_eq!(stored(&f).await.unwrap().state, SessionState::Closed);

        let inbound = {
            let o = Arc::clone(&f.orchestrator);
            tokio::spawn(async move { o.handle_inbound(msg("b")).await })
        };
        secs(1).await;
        // Held until the close has deleted the old entry.
        assert!(!inbound.is_finished());
        assert_eq!(stored(&f).await.unwrap().state, SessionState::Closed);

        *f.hooks.cleanup_gate.lock() = None;
        gate.notify_one();
        assert!(closing.await.unwrap());
        inbound.await.unwrap();

        let entry = stored(&f).await.unwrap();
        assert_eq!(entry.state, SessionState::Debouncing);
        assert_eq!(entry.focus_score, 1);
        assert_eq!(f.orchestrator.tracked(), 1);

        secs(4).await;
        assert_eq!(f.hooks.processed(), vec![vec!["a"], vec!["b"]]);
        assert_eq!(stored(&f).await.unwrap().state, SessionState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_entry_is_replaced_not_revived() {
        let f = fixture(config());
        let mut leftover = SessionEntry::new(key(), Utc::now());
        leftover.state = SessionState::Closed;
        leftover.focus_score = 7;
        leftover.files.push(PathBuf::from("/tmp/old.jpg"));
        f.sessions
            .save(&key().to_string(), &leftover, Duration::from_secs(60))
            .await
            .unwrap();

        f.orchestrator.handle_inbound(msg("hi")).await;
        let entry = stored(&f).await.unwrap();
        assert_eq!(entry.state, SessionState::Debouncing);
        assert_eq!(entry.focus_score, 1);
        assert!(entry.files.is_empty());
    }
}
