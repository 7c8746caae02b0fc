//! REST handlers over the core services.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::SET_COOKIE;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mediator::{DestroySessionInput, FailingReason, SessionBuildResult};
use crate::models::{Session, SessionLog, SessionStatus};
use crate::services::request::TRACKING_COOKIE;
use crate::types::SessionUuid;

use super::AppState;

/// Errors surfaced by the REST layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Session not found.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Application not found (or no default application).
    #[error("application not found")]
    ApplicationNotFound,

    /// The core rejected a build request.
    #[error("{message}")]
    BuildRejected {
        reason: FailingReason,
        message: String,
    },

    /// A worker queue is gone; only observable during shutdown.
    #[error("service unavailable")]
    Unavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ApplicationNotFound => StatusCode::NOT_FOUND,
            ApiError::BuildRejected { .. } => StatusCode::CONFLICT,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

/// Wire form of a session.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub uuid: SessionUuid,
    pub name: String,
    pub checkout: String,
    pub commit_id: Option<String>,
    pub status: SessionStatus,
    pub port: u16,
    pub target: String,
    pub max_age: i64,
}

impl SessionView {
    fn from_session(session: &Arc<Session>) -> Self {
        SessionView {
            uuid: session.uuid,
            name: session.application_name.clone(),
            checkout: session.checkout.clone(),
            commit_id: session.commit_id().map(|sha| sha.to_string()),
            status: session.status(),
            port: session.port(),
            target: session.target(),
            max_age: session.max_age(),
        }
    }
}

/// Wire form of an application.
#[derive(Debug, Serialize)]
pub struct ApplicationView {
    pub name: String,
    pub is_default: bool,
    pub branches: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub applications: Vec<ApplicationView>,
    pub sessions: Vec<SessionView>,
}

/// Liveness probe.
pub async fn health_handler() -> &'static str {
    "OK"
}

/// Applications and alive sessions.
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusView> {
    let applications = state
        .application_storage()
        .get_all()
        .iter()
        .map(|application| {
            let (branches, tags) = application.with_git_state(|git_state| {
                let mut branches: Vec<String> = git_state.branches.keys().cloned().collect();
                branches.sort();
                (branches, git_state.tags.clone())
            });
            ApplicationView {
                name: application.name.clone(),
                is_default: application.is_default(),
                branches,
                tags,
            }
        })
        .collect();

    let sessions = state
        .session_storage()
        .get_all_alive_sessions()
        .iter()
        .map(SessionView::from_session)
        .collect();

    Json(StatusView {
        applications,
        sessions,
    })
}

#[derive(Debug, Deserialize)]
pub struct NewSessionRequest {
    /// Defaults to the `is_default` application when absent.
    pub application_name: Option<String>,
    pub checkout: String,
}

/// Requests a session build for an application and checkout.
pub async fn new_session_handler(
    State(state): State<AppState>,
    Json(request): Json<NewSessionRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let application = state
        .application_storage()
        .get_or_default(request.application_name.as_deref())
        .ok_or(ApiError::ApplicationNotFound)?;

    let result = state
        .request_service()
        .request_new_session(application, &request.checkout, None)
        .await;

    match result {
        SessionBuildResult::Succeeded { session } => Ok(Json(SessionView::from_session(&session))),
        SessionBuildResult::Failed { reason, message } => {
            Err(ApiError::BuildRejected { reason, message })
        }
    }
}

fn lookup_session(state: &AppState, uuid: &str) -> Result<Arc<Session>, ApiError> {
    let parsed =
        SessionUuid::parse(uuid).ok_or_else(|| ApiError::SessionNotFound(uuid.to_string()))?;
    state
        .session_storage()
        .get_by_uuid(parsed)
        .ok_or_else(|| ApiError::SessionNotFound(uuid.to_string()))
}

/// Session detail.
pub async fn session_detail_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session = lookup_session(&state, &uuid)?;
    Ok(Json(SessionView::from_session(&session)))
}

/// Session log lines.
pub async fn session_logs_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<Vec<SessionLog>>, ApiError> {
    let session = lookup_session(&state, &uuid)?;
    Ok(Json(session.logs()))
}

/// Pins the caller to a session.
///
/// Refreshes the session's inactivity deadline and answers with the
/// tracking cookie; subsequent requests carrying it bypass path routing
/// and land on this session until it dies.
pub async fn track_session_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Response, ApiError> {
    let session = state
        .request_service()
        .session_by_tracking_cookie(&uuid)
        .ok_or(ApiError::SessionNotFound(uuid))?;

    let cookie = format!("{TRACKING_COOKIE}={}; Path=/", session.uuid);
    Ok((
        [(SET_COOKIE, cookie)],
        Json(SessionView::from_session(&session)),
    )
        .into_response())
}

/// Destroys a session.
pub async fn destroy_session_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session = lookup_session(&state, &uuid)?;
    state
        .mediator()
        .destroy_session
        .enqueue(DestroySessionInput::new(session))
        .await
        .map_err(|_| ApiError::Unavailable)?;
    Ok(StatusCode::ACCEPTED)
}
