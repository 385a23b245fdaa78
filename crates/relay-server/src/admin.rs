//! Operator endpoints: health, live sessions and the cluster view.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use relay_core::SessionKey;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::ServerError;
use crate::heartbeat::VERSION;
use crate::manager::Manager;

#[derive(Clone)]
pub struct AdminState {
    pub manager: Arc<Manager>,
}

pub fn build_router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{key}", get(get_session).delete(close_session))
        .route("/cluster/servers", get(cluster_servers))
        .route("/cluster/activity", get(cluster_activity))
        .route("/cluster/stats", get(cluster_stats))
        .with_state(AdminState { manager })
        .layer(TraceLayer::new_for_http())
}

/// Bind the admin router and serve it until `cancel` fires.
pub async fn start_admin(
    manager: Arc<Manager>,
    host: &str,
    port: u16,
    cancel: CancellationToken,
) -> Result<AdminHandle, ServerError> {
    let listener = TcpListener::bind((host, port)).await?;
    let local_addr = listener.local_addr()?;
    let router = build_router(manager);
    info!(addr = %local_addr, "admin router listening");

    let task = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %e, "admin server failed");
        }
    });
    Ok(AdminHandle {
        port: local_addr.port(),
        task,
    })
}

pub struct AdminHandle {
    pub port: u16,
    task: JoinHandle<()>,
}

impl AdminHandle {
    /// Wait for the server to finish after its cancel token fired.
    pub async fn stopped(self) {
        let _ = self.task.await;
    }
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let m = &state.manager;
    let backend_ok = match m.backend().ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "backend ping failed");
            false
        }
    };
    let body = json!({
        "status": if backend_ok { "healthy" } else { "degraded" },
        "serverId": m.server_id(),
        "version": VERSION,
        "uptimeSecs": m.uptime().as_secs(),
        "backend": m.backend().name(),
        "trackedSessions": m.orchestrator().tracked(),
        "channels": m.presence().channels(),
    });
    let status = if backend_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

fn parse_key(raw: &str) -> Result<SessionKey, ServerError> {
    raw.parse()
        .map_err(|e: relay_core::ids::InvalidSessionKey| ServerError::BadRequest(e.to_string()))
}

async fn list_sessions(State(state): State<AdminState>) -> Result<impl IntoResponse, ServerError> {
    let sessions = state.manager.orchestrator().list_active().await?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<AdminState>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let key = parse_key(&raw)?;
    match state.manager.orchestrator().get(&key).await? {
        Some(entry) => Ok(Json(entry)),
        None => Err(ServerError::NotFound(format!("session {key}"))),
    }
}

async fn close_session(
    State(state): State<AdminState>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let key = parse_key(&raw)?;
    let closed = state.manager.orchestrator().force_close(&key).await;
    Ok(Json(json!({ "sessionKey": key, "closed": closed })))
}

async fn cluster_servers(State(state): State<AdminState>) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.manager.monitoring().get_active_servers().await?))
}

async fn cluster_activity(State(state): State<AdminState>) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.manager.monitoring().get_cluster_activity().await?))
}

async fn cluster_stats(State(state): State<AdminState>) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.manager.monitoring().get_global_stats().await?))
}
