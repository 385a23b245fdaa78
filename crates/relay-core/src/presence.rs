use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::MediaKind;
use crate::ids::ChannelId;
use crate::record::Record;
use crate::transport::ConnectionStatus;

/// Connection lifecycle of one transport channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelPresence {
    pub channel_id: ChannelId,
    pub state: ConnectionStatus,
    pub is_socket_connected: bool,
    pub last_activity: DateTime<Utc>,
    pub hibernated_at: Option<DateTime<Utc>>,
}

impl ChannelPresence {
    pub fn connected(channel_id: ChannelId, now: DateTime<Utc>) -> Self {
        Self {
            channel_id,
            state: ConnectionStatus::Connected,
            is_socket_connected: true,
            last_activity: now,
            hibernated_at: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PresenceUpdate {
    /// Moves the state machine; the socket flag and hibernation stamp follow it.
    State {
        state: ConnectionStatus,
        at: DateTime<Utc>,
    },
    SocketConnected(bool),
    Touch(DateTime<Utc>),
}

impl Record for ChannelPresence {
    type Update = PresenceUpdate;
    const KIND: &'static str = "presence";

    fn apply(&mut self, update: &PresenceUpdate) {
        match update {
            PresenceUpdate::State { state, at } => {
                self.state = *state;
                self.is_socket_connected = matches!(state, ConnectionStatus::Connected);
                self.hibernated_at = match state {
                    ConnectionStatus::Hibernating => Some(*at),
                    _ => None,
                };
            }
            PresenceUpdate::SocketConnected(connected) => self.is_socket_connected = *connected,
            PresenceUpdate::Touch(at) => {
                if *at > self.last_activity {
                    self.last_activity = *at;
                }
            }
        }
    }
}

/// Short-lived "user is composing" indicator for one conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypingState {
    pub media: MediaKind,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TypingUpdate {
    Media {
        media: MediaKind,
        at: DateTime<Utc>,
    },
}

impl Record for TypingState {
    type Update = TypingUpdate;
    const KIND: &'static str = "typing";

    fn apply(&mut self, update: &TypingUpdate) {
        match update {
            TypingUpdate::Media { media, at } => {
                self.media = *media;
                self.updated_at = *at;
            }
        }
    }
}
