//! HTTP surface over the core's query and request services.
//!
//! This module exposes the REST endpoints the dashboard and the reverse
//! proxy consume. The proxy byte-copying itself lives outside the core;
//! handlers here only resolve sessions, trigger builds, and report state.
//!
//! # Endpoints
//!
//! - `GET /health` - liveness probe
//! - `GET /api/status` - applications and alive sessions
//! - `POST /api/session` - request a session build
//! - `GET /api/session/{uuid}` - session detail
//! - `GET /api/session/{uuid}/logs` - session log lines
//! - `POST /api/session/{uuid}/track` - pin the caller via the tracking cookie
//! - `DELETE /api/session/{uuid}` - destroy a session

pub mod handlers;

pub use handlers::ApiError;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::mediator::Mediator;
use crate::services::RequestService;
use crate::startup::Core;
use crate::storage::{ApplicationStore, SessionStore};

/// Shared state passed to all handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    application_storage: Arc<ApplicationStore>,
    session_storage: Arc<SessionStore>,
    request_service: Arc<RequestService>,
    mediator: Mediator,
}

impl AppState {
    pub fn new(core: &Core) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                application_storage: Arc::clone(&core.application_storage),
                session_storage: Arc::clone(&core.session_storage),
                request_service: Arc::clone(&core.request_service),
                mediator: core.mediator.clone(),
            }),
        }
    }

    pub fn application_storage(&self) -> &ApplicationStore {
        &self.inner.application_storage
    }

    pub fn session_storage(&self) -> &SessionStore {
        &self.inner.session_storage
    }

    pub fn request_service(&self) -> &RequestService {
        &self.inner.request_service
    }

    pub fn mediator(&self) -> &Mediator {
        &self.inner.mediator
    }
}

/// Builds the axum router with all endpoints.
pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/status", get(handlers::status_handler))
        .route("/api/session", post(handlers::new_session_handler))
        .route(
            "/api/session/{uuid}",
            get(handlers::session_detail_handler).delete(handlers::destroy_session_handler),
        )
        .route(
            "/api/session/{uuid}/logs",
            get(handlers::session_logs_handler),
        )
        .route(
            "/api/session/{uuid}/track",
            post(handlers::track_session_handler),
        )
        .with_state(app_state)
}
