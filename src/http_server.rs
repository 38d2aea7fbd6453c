//! HTTP server implementation using Axum.

use crate::error::SandboxError;
use crate::sandbox::inspect::{DirEntry, FilePreview};
use crate::sandbox::{RunRequest, RunResult};
use crate::state::{AppState, SessionInfo};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::interval;
use tower_http::trace::TraceLayer;
use tracing::info;

/// How often idle sessions are checked for expiry.
const REAP_INTERVAL_SECS: u64 = 60;

#[derive(Deserialize)]
struct PathQuery {
    path: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        let status = match &self {
            SandboxError::Validation(_) => StatusCode::BAD_REQUEST,
            SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
            SandboxError::Download { .. } => StatusCode::BAD_GATEWAY,
            SandboxError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            SandboxError::EnvironmentBuild { .. }
            | SandboxError::Io(_)
            | SandboxError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(run))
        // Session management
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id", delete(delete_session))
        // Workspace inspection
        .route("/sessions/:id/files", get(list_dir))
        .route("/sessions/:id/preview", get(preview_file))
        .route("/sessions/:id/artifacts/*path", get(get_artifact))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    // Spawn cleanup task
    let sandbox = state.sandbox.clone();
    tokio::spawn(async move {
        let mut interval = interval(Duration::from_secs(REAP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            sandbox.reap_expired_sessions().await;
        }
    });

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn health() -> &'static str {
    "OK"
}

async fn run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResult>, SandboxError> {
    let run_id = uuid::Uuid::new_v4().to_string();
    info!(run_id = %run_id, session_id = ?req.session_id, "POST /run");
    let result = state.sandbox.execute(req, &run_id).await?;
    Ok(Json(result))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sandbox.sessions().list().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, SandboxError> {
    Ok(Json(state.sandbox.session_info(&id).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, SandboxError> {
    state.sandbox.destroy_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_dir(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Vec<DirEntry>>, SandboxError> {
    Ok(Json(state.sandbox.list_dir(&id, query.path.as_deref()).await?))
}

async fn preview_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<FilePreview>, SandboxError> {
    let path = query
        .path
        .ok_or_else(|| SandboxError::Validation("missing path parameter".to_string()))?;
    Ok(Json(state.sandbox.preview_file(&id, &path).await?))
}

async fn get_artifact(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
) -> Result<Response, SandboxError> {
    let (bytes, mime) = state.sandbox.read_artifact(&id, &path).await?;
    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}
