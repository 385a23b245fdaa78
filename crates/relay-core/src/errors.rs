use std::time::Duration;

use crate::ids::ChannelId;

/// Failures reported by the chat-transport adapter.
/// None of these abort the session state machine; callers log and move on.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel not registered: {0}")]
    NotRegistered(ChannelId),
    #[error("channel disconnected: {0}")]
    Disconnected(ChannelId),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("presence update failed: {0}")]
    PresenceFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Disconnected(_) | Self::SendFailed(_) | Self::Timeout(_)
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotRegistered(_) => "not_registered",
            Self::Disconnected(_) => "disconnected",
            Self::SendFailed(_) => "send_failed",
            Self::PresenceFailed(_) => "presence_failed",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Failures reported by the reply-generation engine.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("reply generation failed: {0}")]
    Failed(String),
    #[error("input rejected: {0}")]
    Rejected(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ReplyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Timeout(_))
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Rejected(_) => "rejected",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_retryable_classification() {
        assert!(TransportError::SendFailed("eof".into()).is_retryable());
        assert!(TransportError::Disconnected("c".into()).is_retryable());
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!TransportError::NotRegistered("c".into()).is_retryable());
        assert!(!TransportError::Cancelled.is_retryable());
    }

    #[test]
    fn reply_retryable_classification() {
        assert!(ReplyError::Failed("boom".into()).is_retryable());
        assert!(!ReplyError::Rejected("empty".into()).is_retryable());
        assert!(!ReplyError::Cancelled.is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(TransportError::Cancelled.error_kind(), "cancelled");
        assert_eq!(
            TransportError::PresenceFailed("x".into()).error_kind(),
            "presence_failed"
        );
        assert_eq!(
            ReplyError::Timeout(Duration::from_secs(3)).error_kind(),
            "timeout"
        );
    }
}
