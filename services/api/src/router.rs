//! Axum Router Configuration
//!
//! HTTP routing for the avatar endpoints and the OpenAPI documentation.

use crate::{
    handlers,
    models::{
        AckResponse, CacheCounts, ErrorResponse, FlushPayload, FlushResponse, SessionSummary,
        StartSessionResponse, TextPayload,
    },
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::start_session,
        handlers::send_text,
        handlers::drive_text,
        handlers::push_audio,
        handlers::stop_session,
        handlers::flush_responses,
        handlers::list_sessions,
        handlers::cache_counts,
        handlers::discard_cache,
    ),
    components(
        schemas(StartSessionResponse, TextPayload, FlushPayload, FlushResponse, AckResponse, SessionSummary, CacheCounts, ErrorResponse)
    ),
    tags(
        (name = "Avatar API", description = "Real-time avatar interaction sessions")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/api/avatar/start", post(handlers::start_session))
        .route("/api/avatar/send", post(handlers::send_text))
        .route("/api/avatar/drive", post(handlers::drive_text))
        .route("/api/avatar/audio", post(handlers::push_audio))
        .route(
            "/api/avatar/stop",
            post(handlers::stop_session).get(handlers::stop_session),
        )
        .route("/api/avatar/flush", post(handlers::flush_responses))
        .route("/api/avatar/sessions", get(handlers::list_sessions))
        .route(
            "/api/avatar/cache/{session_id}",
            get(handlers::cache_counts).delete(handlers::discard_cache),
        )
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
