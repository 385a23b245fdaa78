//! In-memory collaborators for deterministic tests without a live transport
//! or reply engine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::{ReplyError, TransportError};
use crate::ids::{ChannelId, ChatId};
use crate::reply::{AssembledInput, ReplyEngine, ReplyOutput};
use crate::transport::{ConnectionStatus, Transport};

/// One outbound call observed by [`MockTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    Start(ChannelId),
    Stop(ChannelId),
    Hibernate(ChannelId),
    Resume(ChannelId),
    Send {
        channel: ChannelId,
        chat: ChatId,
        text: String,
    },
    MarkRead {
        channel: ChannelId,
        chat: ChatId,
        message_ids: Vec<String>,
    },
}

/// Transport that records every call and tracks per-channel status.
pub struct MockTransport {
    statuses: Mutex<HashMap<ChannelId, ConnectionStatus>>,
    calls: Mutex<Vec<TransportCall>>,
    fail_sends: AtomicBool,
    idle: AtomicBool,
    failed_sends: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            idle: AtomicBool::new(true),
            failed_sends: AtomicUsize::new(0),
        }
    }

    /// Make every `send_message` fail with `SendFailed`.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// Control what `wait_idle` reports.
    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn sent(&self) -> Vec<(ChannelId, ChatId, String)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TransportCall::Send {
                    channel,
                    chat,
                    text,
                } => Some((channel.clone(), chat.clone(), text.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn hibernate_count(&self, channel: &ChannelId) -> usize {
        self.count(|c| matches!(c, TransportCall::Hibernate(ch) if ch == channel))
    }

    pub fn resume_count(&self, channel: &ChannelId) -> usize {
        self.count(|c| matches!(c, TransportCall::Resume(ch) if ch == channel))
    }

    pub fn failed_sends(&self) -> usize {
        self.failed_sends.load(Ordering::Relaxed)
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }

    fn transition(
        &self,
        channel: &ChannelId,
        to: ConnectionStatus,
    ) -> Result<(), TransportError> {
        let mut statuses = self.statuses.lock();
        match statuses.get_mut(channel) {
            Some(status) => {
                *status = to;
                Ok(())
            }
            None => Err(TransportError::NotRegistered(channel.clone())),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.record(TransportCall::Start(channel.clone()));
        self.statuses
            .lock()
            .insert(channel.clone(), ConnectionStatus::Connected);
        Ok(())
    }

    async fn stop(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.record(TransportCall::Stop(channel.clone()));
        self.statuses.lock().remove(channel);
        Ok(())
    }

    async fn hibernate(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.record(TransportCall::Hibernate(channel.clone()));
        self.transition(channel, ConnectionStatus::Hibernating)
    }

    async fn resume(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.record(TransportCall::Resume(channel.clone()));
        self.transition(channel, ConnectionStatus::Connected)
    }

    fn status(&self, channel: &ChannelId) -> ConnectionStatus {
        self.statuses
            .lock()
            .get(channel)
            .copied()
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    async fn send_message(
        &self,
        channel: &ChannelId,
        chat: &ChatId,
        text: &str,
    ) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::Relaxed) {
            self.failed_sends.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::SendFailed("mock send failure".into()));
        }
        self.record(TransportCall::Send {
            channel: channel.clone(),
            chat: chat.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn mark_read(
        &self,
        channel: &ChannelId,
        chat: &ChatId,
        message_ids: &[String],
    ) -> Result<(), TransportError> {
        self.record(TransportCall::MarkRead {
            channel: channel.clone(),
            chat: chat.clone(),
            message_ids: message_ids.to_vec(),
        });
        Ok(())
    }

    async fn wait_idle(
        &self,
        _channel: &ChannelId,
        _chat: &ChatId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        if self.idle.load(Ordering::Relaxed) {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = cancel.cancelled() => {}
        }
        self.idle.load(Ordering::Relaxed)
    }
}

/// Pre-programmed reply for [`MockReplyEngine`].
pub enum MockReply {
    Text(String),
    /// Reply (optionally) and ask the gateway to close the session.
    Close(Option<String>),
    /// Produce no outbound text.
    Silent,
    Error(ReplyError),
    /// Wait a duration, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Reply engine that serves queued replies, then echoes the input.
pub struct MockReplyEngine {
    replies: Mutex<VecDeque<MockReply>>,
    inputs: Mutex<Vec<AssembledInput>>,
    call_count: AtomicUsize,
}

impl Default for MockReplyEngine {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MockReplyEngine {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            inputs: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn inputs(&self) -> Vec<AssembledInput> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl ReplyEngine for MockReplyEngine {
    async fn process(
        &self,
        input: AssembledInput,
        cancel: CancellationToken,
    ) -> Result<ReplyOutput, ReplyError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        let echo = format!("echo: {}", input.text);
        self.inputs.lock().push(input);

        let mut reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or(MockReply::Text(echo));

        loop {
            match reply {
                MockReply::Delay(delay, inner) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ReplyError::Cancelled),
                    }
                    reply = *inner;
                }
                MockReply::Text(text) => return Ok(ReplyOutput::text(text)),
                MockReply::Close(text) => return Ok(ReplyOutput::closing(text)),
                MockReply::Silent => return Ok(ReplyOutput::default()),
                MockReply::Error(e) => return Err(e),
            }
        }
    }
}
