use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{ChannelId, ChatId, SessionKey};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    Document,
    Sticker,
}

/// Media already downloaded by the transport adapter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub path: Option<PathBuf>,
    pub mime_type: Option<String>,
}

/// A chat message delivered by the transport adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel_id: ChannelId,
    pub chat_id: ChatId,
    pub sender_id: String,
    pub message_id: String,
    pub text: String,
    pub media: Option<MediaAttachment>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Plain text message with a generated message id.
    pub fn text(
        channel_id: impl Into<ChannelId>,
        chat_id: impl Into<ChatId>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            message_id: format!("msg_{}", Uuid::now_v7()),
            text: text.into(),
            media: None,
            metadata: serde_json::Map::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_media(mut self, media: MediaAttachment) -> Self {
        self.media = Some(media);
        self
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.channel_id.clone(), self.chat_id.clone())
    }
}

/// Presence-style signals that wake a channel without entering the debounce pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityKind {
    Composing { media: MediaKind },
    Paused,
    ChatOpened,
    ChatClosed,
    Online,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub channel_id: ChannelId,
    pub chat_id: Option<ChatId>,
    pub kind: ActivityKind,
    pub at: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn new(channel_id: impl Into<ChannelId>, chat_id: Option<ChatId>, kind: ActivityKind) -> Self {
        Self {
            channel_id: channel_id.into(),
            chat_id,
            kind,
            at: Utc::now(),
        }
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.chat_id
            .as_ref()
            .map(|chat| SessionKey::new(self.channel_id.clone(), chat.clone()))
    }
}

/// Everything the transport adapter feeds into the gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    Message(InboundMessage),
    Activity(ActivityEvent),
}

impl TransportEvent {
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            Self::Message(m) => &m.channel_id,
            Self::Activity(a) => &a.channel_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_builds_session_key() {
        let msg = InboundMessage::text("chanA", "chat1", "user-7", "hello");
        assert_eq!(msg.session_key().to_string(), "chanA|chat1");
        assert!(msg.message_id.starts_with("msg_"));
    }

    #[test]
    fn activity_without_chat_has_no_session() {
        let ev = ActivityEvent::new("chanA", None, ActivityKind::Online);
        assert!(ev.session_key().is_none());
        let ev = ActivityEvent::new("chanA", Some("chat1".into()), ActivityKind::Paused);
        assert_eq!(ev.session_key().unwrap().to_string(), "chanA|chat1");
    }

    #[test]
    fn transport_event_tagged_json() {
        let ev = TransportEvent::Activity(ActivityEvent::new(
            "c",
            Some("u".into()),
            ActivityKind::Composing {
                media: MediaKind::Audio,
            },
        ));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "activity");
        assert_eq!(json["kind"]["kind"], "composing");
        assert_eq!(json["kind"]["media"], "audio");
        assert_eq!(ev.channel_id().as_str(), "c");
    }
}
