use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::ReplyError;
use crate::events::InboundMessage;
use crate::ids::{BotId, SessionKey};
use crate::session::MemoryTurn;

/// A settled burst, ready for the reply engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssembledInput {
    pub session_key: SessionKey,
    pub bot_id: Option<BotId>,
    pub sender_id: String,
    pub language: Option<String>,
    /// Texts of the burst joined by newlines, in arrival order.
    pub text: String,
    pub messages: Vec<InboundMessage>,
    pub memory: Vec<MemoryTurn>,
    pub files: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyOutput {
    pub text: Option<String>,
    /// Ask the gateway to end the conversation after this reply.
    #[serde(default)]
    pub close_session: bool,
    pub language: Option<String>,
}

impl ReplyOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn closing(text: Option<String>) -> Self {
        Self {
            text,
            close_session: true,
            language: None,
        }
    }
}

#[async_trait]
pub trait ReplyEngine: Send + Sync {
    async fn process(
        &self,
        input: AssembledInput,
        cancel: CancellationToken,
    ) -> Result<ReplyOutput, ReplyError>;
}
