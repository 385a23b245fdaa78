use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_engine::EngineError;
use relay_store::StoreError;
use thiserror::Error;

/// Errors that can occur when loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value was out of range or inconsistent with another one.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

impl SettingsError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::InvalidValue(_) => "invalid_value",
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ServerError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Settings(e) => e.error_kind(),
            Self::Store(e) => e.error_kind(),
            Self::Engine(e) => e.error_kind(),
            Self::Io(_) => "io",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::Engine(EngineError::InvalidChannel(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Engine(EngineError::ChannelNotRegistered(_)) => StatusCode::NOT_FOUND,
            Self::Store(StoreError::LockTimeout { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, kind = self.error_kind(), "admin request failed");
        }
        let body = serde_json::json!({
            "error": self.error_kind(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_kind() {
        assert_eq!(
            ServerError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServerError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        let timeout = ServerError::from(StoreError::LockTimeout {
            key: "k".into(),
            attempts: 3,
        });
        assert_eq!(timeout.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(timeout.error_kind(), "lock_timeout");
    }

    #[test]
    fn settings_error_display() {
        let err = SettingsError::InvalidValue("debounceMs must be positive".into());
        assert!(err.to_string().contains("debounceMs"));
        assert_eq!(ServerError::from(err).error_kind(), "invalid_value");
    }
}
