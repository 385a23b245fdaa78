//! Turns a settled burst into a reply: access control, input assembly, the
//! reply engine call on the processing pool, and dispatch through the
//! transport.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use relay_core::directory::ChannelDirectory;
use relay_core::events::InboundMessage;
use relay_core::reply::{AssembledInput, ReplyEngine, ReplyOutput};
use relay_core::session::{MemoryTurn, SessionEntry, SessionUpdate};
use relay_core::transport::Transport;
use relay_core::{BotId, ChannelId, ReplyError, SessionKey};
use relay_store::KvStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::orchestrator::{ProcessOutcome, SessionHooks};
use crate::presence::PresenceManager;
use crate::worker::WorkerPool;

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Remembered exchanges per session.
    pub memory_turns: usize,
    /// Longest wait for the chat to go quiet before a reply is sent.
    pub wait_idle_timeout: Duration,
    pub reply_timeout: Duration,
    /// Sent when a session is about to close for inactivity.
    pub warning_text: Option<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            memory_turns: 20,
            wait_idle_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(120),
            warning_text: None,
        }
    }
}

/// Processing and outbound worker pools.
#[derive(Clone)]
pub struct ProcessorPools {
    pub processing: Arc<WorkerPool>,
    pub outbound: Arc<WorkerPool>,
}

pub struct MessageProcessor {
    transport: Arc<dyn Transport>,
    directory: Arc<dyn ChannelDirectory>,
    engine: Arc<dyn ReplyEngine>,
    sessions: Arc<dyn KvStore<SessionEntry>>,
    presence: Arc<PresenceManager>,
    pools: ProcessorPools,
    config: ProcessorConfig,
}

impl MessageProcessor {
    pub fn new(
        transport: Arc<dyn Transport>,
        directory: Arc<dyn ChannelDirectory>,
        engine: Arc<dyn ReplyEngine>,
        sessions: Arc<dyn KvStore<SessionEntry>>,
        presence: Arc<PresenceManager>,
        pools: ProcessorPools,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            transport,
            directory,
            engine,
            sessions,
            presence,
            pools,
            config,
        }
    }

    async fn update(&self, key: &SessionKey, update: SessionUpdate) {
        if let Err(e) = self.sessions.update_field(&key.to_string(), update).await {
            warn!(session_key = %key, error = %e, "session update failed");
        }
    }

    /// Drop messages the channel profile doesn't admit.
    async fn admitted(
        &self,
        key: &SessionKey,
        burst: Vec<InboundMessage>,
    ) -> Option<(Vec<InboundMessage>, BotId)> {
        let Some(profile) = self.directory.lookup(&key.channel_id).await else {
            warn!(channel_id = %key.channel_id, "no profile for channel, dropping burst");
            return None;
        };
        if !profile.enabled {
            debug!(channel_id = %key.channel_id, "channel disabled, dropping burst");
            return None;
        }
        let total = burst.len();
        let admitted: Vec<InboundMessage> = burst
            .into_iter()
            .filter(|m| profile.admits(&m.sender_id))
            .collect();
        if admitted.len() < total {
            debug!(session_key = %key, rejected = total - admitted.len(), "senders filtered");
        }
        if admitted.is_empty() {
            return None;
        }
        Some((admitted, profile.bot_id))
    }

    async fn assemble(
        &self,
        key: &SessionKey,
        burst: Vec<InboundMessage>,
        bot_id: BotId,
    ) -> Option<AssembledInput> {
        let entry = match self.sessions.get(&key.to_string()).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(session_key = %key, "session closed before processing");
                return None;
            }
            Err(e) => {
                warn!(session_key = %key, error = %e, "session lookup failed, processing without history");
                SessionEntry::new(key.clone(), Utc::now())
            }
        };

        if entry.bot_id.as_ref() != Some(&bot_id) {
            self.update(key, SessionUpdate::BotId(bot_id.clone())).await;
        }
        let mut files = entry.files;
        for path in burst.iter().filter_map(|m| m.media.as_ref()?.path.clone()) {
            if !files.contains(&path) {
                self.update(key, SessionUpdate::AddFile(path.clone())).await;
                files.push(path);
            }
        }

        let text = burst
            .iter()
            .map(|m| m.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let sender_id = burst
            .last()
            .map(|m| m.sender_id.clone())
            .unwrap_or_default();

        Some(AssembledInput {
            session_key: key.clone(),
            bot_id: Some(bot_id),
            sender_id,
            language: entry.language,
            text,
            messages: burst,
            memory: entry.memory,
            files,
        })
    }

    async fn generate(
        &self,
        key: &SessionKey,
        input: AssembledInput,
        cancel: &CancellationToken,
    ) -> Result<ReplyOutput, EngineError> {
        let engine = Arc::clone(&self.engine);
        let timeout = self.config.reply_timeout;
        let cancel = cancel.child_token();
        self.pools
            .processing
            .run(key.clone(), async move {
                match tokio::time::timeout(timeout, engine.process(input, cancel.clone())).await {
                    Ok(result) => result.map_err(EngineError::from),
                    Err(_) => {
                        cancel.cancel();
                        Err(ReplyError::Timeout(timeout).into())
                    }
                }
            })
            .await
    }

    async fn dispatch(&self, key: &SessionKey, text: &str, cancel: &CancellationToken) {
        let (channel, chat) = (&key.channel_id, &key.chat_id);
        let idle = self
            .transport
            .wait_idle(channel, chat, self.config.wait_idle_timeout, cancel)
            .await;
        if !idle {
            debug!(session_key = %key, "chat still busy, sending anyway");
        }
        if let Err(e) = self.transport.send_message(channel, chat, text).await {
            warn!(session_key = %key, error = %e, kind = e.error_kind(), "reply send failed");
        }
    }
}

#[async_trait]
impl SessionHooks for MessageProcessor {
    async fn process(
        &self,
        key: &SessionKey,
        burst: Vec<InboundMessage>,
        cancel: CancellationToken,
    ) -> ProcessOutcome {
        let Some((burst, bot_id)) = self.admitted(key, burst).await else {
            return ProcessOutcome::default();
        };

        let ids: Vec<String> = burst.iter().map(|m| m.message_id.clone()).collect();
        if let Err(e) = self
            .transport
            .mark_read(&key.channel_id, &key.chat_id, &ids)
            .await
        {
            debug!(session_key = %key, error = %e, "mark read failed");
        }

        let Some(input) = self.assemble(key, burst, bot_id).await else {
            return ProcessOutcome::default();
        };
        let user_text = input.text.clone();

        let output = match self.generate(key, input, &cancel).await {
            Ok(output) => output,
            Err(e) => {
                warn!(session_key = %key, error = %e, kind = e.error_kind(), "reply generation failed");
                return ProcessOutcome::default();
            }
        };

        let now = Utc::now();
        if let Some(reply) = output.text.as_deref().filter(|t| !t.trim().is_empty()) {
            self.dispatch(key, reply, &cancel).await;
            self.update(key, SessionUpdate::LastReplyTime(now)).await;
            self.update(
                key,
                SessionUpdate::AppendMemory {
                    turn: MemoryTurn {
                        user: user_text,
                        reply: reply.to_string(),
                        at: now,
                    },
                    max_turns: self.config.memory_turns,
                },
            )
            .await;
        }
        if let Some(language) = output.language {
            self.update(key, SessionUpdate::Language(language)).await;
        }
        if output.close_session {
            info!(session_key = %key, "reply engine closed the session");
        }
        ProcessOutcome {
            close_session: output.close_session,
        }
    }

    async fn inactivity_warning(&self, key: &SessionKey) {
        let Some(text) = self.config.warning_text.clone() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let (channel, chat) = (key.channel_id.clone(), key.chat_id.clone());
        let job = async move {
            match transport.send_message(&channel, &chat, &text).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(channel_id = %channel, chat_id = %chat, error = %e, "inactivity warning send failed");
                    false
                }
            }
        }
        .boxed();
        if let Err(e) = self.pools.outbound.submit(key.clone(), job).await {
            warn!(session_key = %key, error = %e, "inactivity warning not queued");
        }
    }

    async fn cleanup_files(&self, key: &SessionKey, files: &[PathBuf]) {
        for path in files {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(session_key = %key, path = %path.display(), "session file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(session_key = %key, path = %path.display(), error = %e, "session file removal failed");
                }
            }
        }
    }

    async fn channel_idle(&self, channel: &ChannelId) {
        match self.presence.check_idle(channel).await {
            Ok(true) => debug!(channel_id = %channel, "channel hibernated"),
            Ok(false) => {}
            Err(e) => warn!(channel_id = %channel, error = %e, "idle check failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::directory::{ChannelProfile, StaticDirectory};
    use relay_core::events::{MediaAttachment, MediaKind};
    use relay_core::mock::{MockReply, MockReplyEngine, MockTransport, TransportCall};
    use relay_core::transport::ConnectionStatus;
    use relay_core::ServerId;
    use relay_store::{Keyspace, MemoryCache, MemoryStore, MonitoringConfig, MonitoringStore};
    use relay_telemetry::MetricsRecorder;

    use crate::presence::{PresenceConfig, SessionCounter};
    use crate::worker::WorkerPoolConfig;

    struct Fixture {
        processor: MessageProcessor,
        transport: Arc<MockTransport>,
        engine: Arc<MockReplyEngine>,
        directory: Arc<StaticDirectory>,
        sessions: Arc<MemoryStore<SessionEntry>>,
        presence: Arc<PresenceManager>,
        cancel: CancellationToken,
    }

    fn fixture(replies: Vec<MockReply>, config: ProcessorConfig) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let engine = Arc::new(MockReplyEngine::new(replies));
        let directory = Arc::new(StaticDirectory::with_profiles([ChannelProfile::open(
            "chanA".into(),
            "bot1".into(),
            "ws",
        )]));
        let sessions = Arc::new(MemoryStore::<SessionEntry>::new());
        let metrics = Arc::new(MetricsRecorder::new());
        let presence = Arc::new(PresenceManager::new(
            transport.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(SessionCounter::new(sessions.clone())),
            PresenceConfig::default(),
            metrics.clone(),
        ));
        let monitoring = MonitoringStore::new(
            Arc::new(MemoryCache::new()),
            Keyspace::new("t"),
            MonitoringConfig::default(),
        );
        let cancel = CancellationToken::new();
        let pool = |config: WorkerPoolConfig| {
            Arc::new(WorkerPool::start(
                config,
                ServerId::from_raw("srv"),
                monitoring.clone(),
                metrics.clone(),
                cancel.clone(),
            ))
        };
        let pools = ProcessorPools {
            processing: pool(WorkerPoolConfig::processing()),
            outbound: pool(WorkerPoolConfig::outbound()),
        };
        let processor = MessageProcessor::new(
            transport.clone(),
            directory.clone(),
            engine.clone(),
            sessions.clone(),
            presence.clone(),
            pools,
            config,
        );
        Fixture {
            processor,
            transport,
            engine,
            directory,
            sessions,
            presence,
            cancel,
        }
    }

    fn key() -> SessionKey {
        SessionKey::new("chanA".into(), "chat1".into())
    }

    fn msg(sender: &str, text: &str) -> InboundMessage {
        InboundMessage::text("chanA", "chat1", sender, text)
    }

    async fn seed(f: &Fixture) {
        f.sessions
            .save(
                &key().to_string(),
                &SessionEntry::new(key(), Utc::now()),
                Duration::from_secs(600),
            )
            .await
            .unwrap();
    }

    async fn stored(f: &Fixture) -> SessionEntry {
        f.sessions.get(&key().to_string()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn burst_is_joined_answered_and_remembered() {
        let f = fixture(vec![MockReply::Text("hello!".into())], ProcessorConfig::default());
        seed(&f).await;
        let burst = vec![msg("u1", "hi"), msg("u1", "  "), msg("u1", "there")];
        let ids: Vec<String> = burst.iter().map(|m| m.message_id.clone()).collect();

        let outcome = f.processor.process(&key(), burst, f.cancel.clone()).await;
        assert!(!outcome.close_session);

        let inputs = f.engine.inputs();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].text, "hi\nthere");
        assert_eq!(inputs[0].bot_id, Some("bot1".into()));

        let calls = f.transport.calls();
        assert!(calls.contains(&TransportCall::MarkRead {
            channel: "chanA".into(),
            chat: "chat1".into(),
            message_ids: ids,
        }));
        let sent = f.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.as_str(), "chat1");
        assert_eq!(sent[0].2, "hello!");

        let entry = stored(&f).await;
        assert_eq!(entry.bot_id, Some("bot1".into()));
        assert!(entry.last_reply_time.is_some());
        assert_eq!(entry.memory.len(), 1);
        assert_eq!(entry.memory[0].user, "hi\nthere");
        assert_eq!(entry.memory[0].reply, "hello!");
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn memory_is_passed_back_and_bounded() {
        let config = ProcessorConfig {
            memory_turns: 2,
            ..Default::default()
        };
        let f = fixture(Vec::new(), config);
        seed(&f).await;
        for text in ["one", "two", "three"] {
            f.processor
                .process(&key(), vec![msg("u1", text)], f.cancel.clone())
                .await;
        }
        let inputs = f.engine.inputs();
        assert_eq!(inputs[2].memory.len(), 2);
        let memory: Vec<String> = stored(&f).await.memory.into_iter().map(|t| t.user).collect();
        assert_eq!(memory, vec!["two", "three"]);
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn blocked_senders_are_filtered() {
        let f = fixture(Vec::new(), ProcessorConfig::default());
        seed(&f).await;
        let mut profile = ChannelProfile::open("chanA".into(), "bot1".into(), "ws");
        profile.blocked_senders.insert("spam".into());
        f.directory.upsert(profile);

        f.processor
            .process(&key(), vec![msg("spam", "buy now")], f.cancel.clone())
            .await;
        assert_eq!(f.engine.call_count(), 0);
        assert!(f.transport.calls().is_empty());

        f.processor
            .process(&key(), vec![msg("spam", "x"), msg("u1", "real")], f.cancel.clone())
            .await;
        assert_eq!(f.engine.inputs()[0].text, "real");
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn disabled_or_unknown_channel_is_skipped() {
        let f = fixture(Vec::new(), ProcessorConfig::default());
        seed(&f).await;
        let mut profile = ChannelProfile::open("chanA".into(), "bot1".into(), "ws");
        profile.enabled = false;
        f.directory.upsert(profile);
        f.processor
            .process(&key(), vec![msg("u1", "hi")], f.cancel.clone())
            .await;
        f.directory.remove(&"chanA".into());
        f.processor
            .process(&key(), vec![msg("u1", "hi")], f.cancel.clone())
            .await;
        assert_eq!(f.engine.call_count(), 0);
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn close_signal_is_reported() {
        let f = fixture(vec![MockReply::Close(Some("bye".into()))], ProcessorConfig::default());
        seed(&f).await;
        let outcome = f
            .processor
            .process(&key(), vec![msg("u1", "stop")], f.cancel.clone())
            .await;
        assert_eq!(outcome, ProcessOutcome::close());
        assert_eq!(f.transport.sent().len(), 1);
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn engine_failure_keeps_session_open() {
        let f = fixture(
            vec![MockReply::Error(ReplyError::Failed("boom".into()))],
            ProcessorConfig::default(),
        );
        seed(&f).await;
        let outcome = f
            .processor
            .process(&key(), vec![msg("u1", "hi")], f.cancel.clone())
            .await;
        assert!(!outcome.close_session);
        assert!(f.transport.sent().is_empty());
        assert!(stored(&f).await.last_reply_time.is_none());
        f.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_engine_times_out() {
        let config = ProcessorConfig {
            reply_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let f = fixture(
            vec![MockReply::delayed(Duration::from_secs(60), MockReply::Text("late".into()))],
            config,
        );
        seed(&f).await;
        let outcome = f
            .processor
            .process(&key(), vec![msg("u1", "hi")], f.cancel.clone())
            .await;
        assert_eq!(outcome, ProcessOutcome::default());
        assert!(f.transport.sent().is_empty());
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn media_paths_become_session_files() {
        let f = fixture(Vec::new(), ProcessorConfig::default());
        seed(&f).await;
        let path = PathBuf::from("/tmp/relay-test/voice.ogg");
        let message = msg("u1", "").with_media(MediaAttachment {
            kind: MediaKind::Audio,
            path: Some(path.clone()),
            mime_type: Some("audio/ogg".into()),
        });
        f.processor
            .process(&key(), vec![message], f.cancel.clone())
            .await;
        assert_eq!(f.engine.inputs()[0].files, vec![path.clone()]);
        assert_eq!(stored(&f).await.files, vec![path]);
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn inactivity_warning_goes_through_outbound_pool() {
        let config = ProcessorConfig {
            warning_text: Some("still there?".into()),
            ..Default::default()
        };
        let f = fixture(Vec::new(), config);
        f.processor.inactivity_warning(&key()).await;
        for _ in 0..50 {
            if !f.transport.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.transport.sent()[0].2, "still there?");
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn no_warning_text_sends_nothing() {
        let f = fixture(Vec::new(), ProcessorConfig::default());
        f.processor.inactivity_warning(&key()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.transport.sent().is_empty());
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn cleanup_removes_files_and_ignores_missing() {
        let f = fixture(Vec::new(), ProcessorConfig::default());
        let dir = std::env::temp_dir().join(format!("relay-files-{}", uuid::Uuid::now_v7()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let present = dir.join("a.jpg");
        tokio::fs::write(&present, b"x").await.unwrap();
        let missing = dir.join("gone.jpg");

        f.processor
            .cleanup_files(&key(), &[present.clone(), missing])
            .await;
        assert!(!present.exists());
        let _ = tokio::fs::remove_dir_all(&dir).await;
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn channel_idle_hibernates_only_without_live_sessions() {
        let f = fixture(Vec::new(), ProcessorConfig::default());
        let channel = ChannelId::from_raw("chanA");
        f.presence.register(&channel).await.unwrap();
        seed(&f).await;

        f.processor.channel_idle(&channel).await;
        assert_eq!(f.transport.status(&channel), ConnectionStatus::Connected);

        f.sessions.delete(&key().to_string()).await.unwrap();
        f.processor.channel_idle(&channel).await;
        assert_eq!(f.transport.status(&channel), ConnectionStatus::Hibernating);
        f.presence.shutdown();
        f.cancel.cancel();
    }
}
