/// Failures of the state store and the distributed lock.
///
/// Absence is never an error: lookups return `Ok(None)` and conditional
/// mutations `Ok(false)`, so a transient outage (`Backend`) can't be mistaken
/// for "no session".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock timeout on {key} after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Backend(_) => "backend_unavailable",
            Self::NotFound(_) => "not_found",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Serialization(_) => "serialization",
            Self::InvalidPattern(_) => "invalid_pattern",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<glob::PatternError> for StoreError {
    fn from(e: glob::PatternError) -> Self {
        StoreError::InvalidPattern(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_display() {
        let e = StoreError::LockTimeout {
            key: "relay:session:a|b:lock".into(),
            attempts: 5,
        };
        assert_eq!(
            e.to_string(),
            "lock timeout on relay:session:a|b:lock after 5 attempts"
        );
        assert_eq!(e.error_kind(), "lock_timeout");
    }

    #[test]
    fn json_error_maps_to_serialization() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(StoreError::from(err), StoreError::Serialization(_)));
    }

    #[test]
    fn pattern_error_maps_to_invalid_pattern() {
        let err = glob::Pattern::new("[").unwrap_err();
        assert_eq!(StoreError::from(err).error_kind(), "invalid_pattern");
    }
}
