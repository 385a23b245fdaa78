//! Stdin/stdout stand-ins for a chat transport and a reply engine, so the
//! gateway can be driven by hand.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::errors::{ReplyError, TransportError};
use relay_core::events::{ActivityEvent, ActivityKind, InboundMessage, MediaKind, TransportEvent};
use relay_core::reply::{AssembledInput, ReplyEngine, ReplyOutput};
use relay_core::transport::{ConnectionStatus, Transport};
use relay_core::{ChannelId, ChatId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Prints outbound messages and keeps per-channel connection status.
#[derive(Default)]
pub struct ConsoleTransport {
    statuses: Mutex<HashMap<ChannelId, ConnectionStatus>>,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(&self, channel: &ChannelId, to: ConnectionStatus) -> Result<(), TransportError> {
        match self.statuses.lock().get_mut(channel) {
            Some(status) => {
                *status = to;
                Ok(())
            }
            None => Err(TransportError::NotRegistered(channel.clone())),
        }
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn start(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.statuses
            .lock()
            .insert(channel.clone(), ConnectionStatus::Connected);
        info!(channel_id = %channel, "console channel started");
        Ok(())
    }

    async fn stop(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.statuses.lock().remove(channel);
        Ok(())
    }

    async fn hibernate(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.transition(channel, ConnectionStatus::Hibernating)?;
        info!(channel_id = %channel, "console channel hibernating");
        Ok(())
    }

    async fn resume(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.transition(channel, ConnectionStatus::Connected)?;
        info!(channel_id = %channel, "console channel resumed");
        Ok(())
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
        if self.status(channel) != ConnectionStatus::Connected {
            return Err(TransportError::Disconnected(channel.clone()));
        }
        println!("[{channel}/{chat}] {text}");
        Ok(())
    }

    async fn mark_read(
        &self,
        _channel: &ChannelId,
        chat: &ChatId,
        message_ids: &[String],
    ) -> Result<(), TransportError> {
        debug!(chat_id = %chat, count = message_ids.len(), "messages read");
        Ok(())
    }

    async fn wait_idle(
        &self,
        _channel: &ChannelId,
        _chat: &ChatId,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        !cancel.is_cancelled()
    }
}

/// Replies with the assembled burst. `/bye` ends the conversation.
pub struct EchoEngine;

#[async_trait]
impl ReplyEngine for EchoEngine {
    async fn process(
        &self,
        input: AssembledInput,
        cancel: CancellationToken,
    ) -> Result<ReplyOutput, ReplyError> {
        if cancel.is_cancelled() {
            return Err(ReplyError::Cancelled);
        }
        if input.text.lines().any(|l| l.trim() == "/bye") {
            return Ok(ReplyOutput::closing(Some("bye!".into())));
        }
        Ok(ReplyOutput::text(format!(
            "you said ({} message(s), {} earlier turn(s)):\n{}",
            input.messages.len(),
            input.memory.len(),
            input.text
        )))
    }
}

/// Parse one console line.
///
/// `chat: text` is a message, `~chat` marks the user as typing in `chat`.
/// Anything else goes to the `console` chat.
pub fn parse_line(channel: &ChannelId, line: &str) -> Option<TransportEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(chat) = line.strip_prefix('~') {
        let chat = chat.trim();
        if chat.is_empty() {
            return None;
        }
        return Some(TransportEvent::Activity(ActivityEvent::new(
            channel.clone(),
            Some(ChatId::from_raw(chat)),
            ActivityKind::Composing {
                media: MediaKind::Text,
            },
        )));
    }
    let (chat, text) = match line.split_once(':') {
        Some((chat, text)) if !chat.trim().is_empty() && !chat.contains(' ') => {
            (chat.trim(), text.trim())
        }
        _ => ("console", line),
    };
    Some(TransportEvent::Message(InboundMessage::text(
        channel.clone(),
        chat,
        chat,
        text,
    )))
}

/// Forward stdin lines as transport events until EOF or cancellation.
pub async fn read_stdin(
    channel: ChannelId,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if let Some(event) = parse_line(&channel, &line) {
            if events.send(event).await.is_err() {
                break;
            }
        }
    }
    debug!("stdin closed");
    Ok(())
}
