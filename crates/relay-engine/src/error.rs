use relay_core::ids::InvalidChannelId;
use relay_core::{ChannelId, ReplyError, TransportError};
use relay_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("reply error: {0}")]
    Reply(#[from] ReplyError),

    #[error(transparent)]
    InvalidChannel(#[from] InvalidChannelId),

    #[error("channel not registered: {0}")]
    ChannelNotRegistered(ChannelId),

    #[error("{pool} queue full")]
    QueueFull { pool: String },

    #[error("shutting down")]
    Shutdown,
}

impl EngineError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_kind(),
            Self::Transport(e) => e.error_kind(),
            Self::Reply(e) => e.error_kind(),
            Self::InvalidChannel(_) => "invalid_channel",
            Self::ChannelNotRegistered(_) => "channel_not_registered",
            Self::QueueFull { .. } => "queue_full",
            Self::Shutdown => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_delegate_to_source() {
        let e = EngineError::from(StoreError::Cancelled);
        assert_eq!(e.error_kind(), "cancelled");
        let e = EngineError::QueueFull {
            pool: "processing".into(),
        };
        assert_eq!(e.to_string(), "processing queue full");
        assert_eq!(e.error_kind(), "queue_full");
    }
}
