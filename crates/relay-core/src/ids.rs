use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh id. Transport-assigned ids go through `from_raw`.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(ChannelId, "chan");
branded_id!(ChatId, "chat");
branded_id!(BotId, "bot");
branded_id!(ServerId, "srv");

/// Separator between the channel and chat halves of a session key.
pub const SESSION_KEY_SEPARATOR: char = '|';

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid channel id {0:?}: must be non-empty and free of '|'")]
pub struct InvalidChannelId(pub String);

impl ChannelId {
    /// Channel ids must not contain the session key separator, so a key
    /// always splits at its first `|` and a channel's sessions never share a
    /// scan prefix with another channel. Chat ids may contain it.
    pub fn validate(&self) -> Result<(), InvalidChannelId> {
        if self.0.is_empty() || self.0.contains(SESSION_KEY_SEPARATOR) {
            return Err(InvalidChannelId(self.0.clone()));
        }
        Ok(())
    }
}

/// Composite identifier of one conversation: `<channel>|<chat>`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SessionKey {
    pub channel_id: ChannelId,
    pub chat_id: ChatId,
}

impl SessionKey {
    pub fn new(channel_id: ChannelId, chat_id: ChatId) -> Self {
        Self {
            channel_id,
            chat_id,
        }
    }

    /// Glob matching every session of one channel.
    pub fn channel_pattern(channel_id: &ChannelId) -> String {
        format!(
            "{}{}*",
            glob_escape(channel_id.as_str()),
            SESSION_KEY_SEPARATOR
        )
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.channel_id, SESSION_KEY_SEPARATOR, self.chat_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid session key: {0}")]
pub struct InvalidSessionKey(pub String);

impl FromStr for SessionKey {
    type Err = InvalidSessionKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(SESSION_KEY_SEPARATOR) {
            Some((channel, chat)) if !channel.is_empty() && !chat.is_empty() => Ok(Self {
                channel_id: ChannelId::from_raw(channel),
                chat_id: ChatId::from_raw(chat),
            }),
            _ => Err(InvalidSessionKey(s.to_owned())),
        }
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for SessionKey {
    type Error = InvalidSessionKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Escape glob metacharacters so an id can be embedded in a scan pattern.
/// Bracket classes are understood by every backend (glob, Redis, SQLite GLOB).
pub fn glob_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '*' | '?' | '[' => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            _ => out.push(c),
        }
    }
    out
}
