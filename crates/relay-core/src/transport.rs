//! Contract of the chat-transport adapter (outbound direction).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::TransportError;
use crate::ids::{ChannelId, ChatId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    /// Socket closed on purpose; the channel stays registered.
    Hibernating,
    /// Error or unauthenticated.
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Hibernating => write!(f, "hibernating"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self, channel: &ChannelId) -> Result<(), TransportError>;
    async fn stop(&self, channel: &ChannelId) -> Result<(), TransportError>;

    /// Close the live socket but keep the channel registered.
    async fn hibernate(&self, channel: &ChannelId) -> Result<(), TransportError>;
    async fn resume(&self, channel: &ChannelId) -> Result<(), TransportError>;

    fn status(&self, channel: &ChannelId) -> ConnectionStatus;

    async fn send_message(
        &self,
        channel: &ChannelId,
        chat: &ChatId,
        text: &str,
    ) -> Result<(), TransportError>;

    async fn mark_read(
        &self,
        channel: &ChannelId,
        chat: &ChatId,
        message_ids: &[String],
    ) -> Result<(), TransportError>;

    /// Wait until the chat has no outbound traffic in flight. Returns `false`
    /// when the timeout elapses or `cancel` fires first.
    async fn wait_idle(
        &self,
        channel: &ChannelId,
        chat: &ChatId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool;
}
