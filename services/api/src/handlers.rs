//! Axum Handlers for the REST API
//!
//! Thin adapters from HTTP requests onto the avatar orchestrator. Each handler
//! carries `utoipa` path docs for the generated OpenAPI document.

use avatar_realtime::{Delivery, FlushOutcome, SessionId};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::error;

use crate::{
    models::{
        AckResponse, CacheCounts, ErrorResponse, FlushPayload, FlushResponse, SessionQuery,
        SessionSummary, StartSessionResponse, TextPayload,
    },
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// The upstream avatar service refused or failed the request.
    BadGateway(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::BadGateway(message) => {
                (StatusCode::BAD_GATEWAY, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn not_found(session_id: &str) -> ApiError {
    ApiError::NotFound(format!(
        "Session {session_id} does not exist or has already closed"
    ))
}

fn delivered(session_id: String, delivery: Delivery) -> Result<Json<AckResponse>, ApiError> {
    match delivery {
        Delivery::Queued => Ok(Json(AckResponse::new(session_id, "queued"))),
        Delivery::NotFound => Err(not_found(&session_id)),
    }
}

fn require_text(payload: &TextPayload) -> Result<(), ApiError> {
    if payload.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".to_string()));
    }
    Ok(())
}

/// Start a new avatar session and wait for its stream.
#[utoipa::path(
    post,
    path = "/api/avatar/start",
    responses(
        (status = 200, description = "Avatar stream is ready", body = StartSessionResponse),
        (status = 502, description = "The avatar service failed to start a stream", body = ErrorResponse)
    )
)]
pub async fn start_session(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StartSessionResponse>, ApiError> {
    let started = state
        .orchestrator
        .start_session()
        .await
        .map_err(|e| ApiError::BadGateway(e.to_string()))?;
    Ok(Json(started.into()))
}

/// Send text for the avatar to answer.
#[utoipa::path(
    post,
    path = "/api/avatar/send",
    request_body = TextPayload,
    responses(
        (status = 200, description = "Text queued", body = AckResponse),
        (status = 400, description = "Empty text", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    )
)]
pub async fn send_text(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TextPayload>,
) -> Result<Json<AckResponse>, ApiError> {
    require_text(&payload)?;
    let session_id = SessionId::from(payload.session_id.as_str());
    let delivery = state
        .orchestrator
        .send_text(&session_id, &payload.text)
        .await;
    delivered(payload.session_id, delivery)
}

/// Make the avatar speak the given text verbatim.
#[utoipa::path(
    post,
    path = "/api/avatar/drive",
    request_body = TextPayload,
    responses(
        (status = 200, description = "Text queued", body = AckResponse),
        (status = 400, description = "Empty text", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    )
)]
pub async fn drive_text(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TextPayload>,
) -> Result<Json<AckResponse>, ApiError> {
    require_text(&payload)?;
    let session_id = SessionId::from(payload.session_id.as_str());
    let delivery = state
        .orchestrator
        .drive_text(&session_id, &payload.text)
        .await;
    delivered(payload.session_id, delivery)
}

/// Stream raw 16 kHz mono PCM audio into a session.
#[utoipa::path(
    post,
    path = "/api/avatar/audio",
    params(SessionQuery),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Audio queued", body = AckResponse),
        (status = 400, description = "Empty body", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    )
)]
pub async fn push_audio(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Result<Json<AckResponse>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("audio body must not be empty".to_string()));
    }
    let session_id = SessionId::from(query.session_id.as_str());
    let delivery = state.orchestrator.push_audio(&session_id, &body).await;
    delivered(query.session_id, delivery)
}

/// Stop a session. Stopping an unknown or closed session succeeds.
#[utoipa::path(
    post,
    path = "/api/avatar/stop",
    params(SessionQuery),
    responses(
        (status = 200, description = "Session stopped", body = AckResponse)
    )
)]
pub async fn stop_session(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Json<AckResponse> {
    let session_id = SessionId::from(query.session_id.as_str());
    state.orchestrator.stop_session(&session_id).await;
    Json(AckResponse::new(query.session_id, "stopped"))
}

/// Save the session's completed replies and answers against an interview record.
#[utoipa::path(
    post,
    path = "/api/avatar/flush",
    request_body = FlushPayload,
    responses(
        (status = 200, description = "Turns saved", body = FlushResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn flush_responses(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<FlushPayload>,
) -> Result<Json<FlushResponse>, ApiError> {
    let session_id = SessionId::from(payload.session_id);
    let outcome = state
        .orchestrator
        .flush_responses(&session_id, payload.interview_record_id)
        .await?;
    let saved_turns = match outcome {
        FlushOutcome::NothingToSave => 0,
        FlushOutcome::Saved { turns } => turns,
    };
    Ok(Json(FlushResponse { saved_turns }))
}

/// List live avatar sessions.
#[utoipa::path(
    get,
    path = "/api/avatar/sessions",
    responses(
        (status = 200, description = "Live sessions", body = [SessionSummary])
    )
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    let sessions = state.orchestrator.list_sessions().await;
    Json(sessions.into_iter().map(SessionSummary::from).collect())
}

/// Count the completed turns cached for a session.
#[utoipa::path(
    get,
    path = "/api/avatar/cache/{session_id}",
    params(("session_id" = String, Path, description = "Avatar session id")),
    responses(
        (status = 200, description = "Cached turn counts", body = CacheCounts)
    )
)]
pub async fn cache_counts(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<CacheCounts> {
    let (responses, answers) = state
        .orchestrator
        .cached_counts(&SessionId::from(session_id.as_str()));
    Json(CacheCounts {
        session_id,
        responses,
        answers,
    })
}

/// Drop everything cached for a session without saving it.
#[utoipa::path(
    delete,
    path = "/api/avatar/cache/{session_id}",
    params(("session_id" = String, Path, description = "Avatar session id")),
    responses(
        (status = 204, description = "Cache cleared")
    )
)]
pub async fn discard_cache(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> StatusCode {
    state
        .orchestrator
        .discard_cache(&SessionId::from(session_id));
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use avatar_realtime::{
        AvatarConfig, AvatarOrchestrator, FlushedTurns, FrameStatus, LogKind, ResponseStore,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Vec<(i64, FlushedTurns)>>,
    }

    #[async_trait]
    impl ResponseStore for MemoryStore {
        async fn save_turns(&self, id: i64, turns: &FlushedTurns) -> anyhow::Result<()> {
            self.saved.lock().unwrap().push((id, turns.clone()));
            Ok(())
        }
    }

    fn state_with(url: &str, store: Arc<MemoryStore>) -> Arc<AppState> {
        let config = AvatarConfig::new(url, "app", "key", "secret", "avatar", "vcn")
            .with_ready_timeout(Duration::from_secs(2));
        Arc::new(AppState {
            orchestrator: AvatarOrchestrator::new(config, store),
        })
    }

    fn state() -> Arc<AppState> {
        state_with("ws://127.0.0.1:9/v1/interact", Arc::default())
    }

    fn text(session_id: &str, text: &str) -> Json<TextPayload> {
        Json(TextPayload {
            session_id: session_id.to_string(),
            text: text.to_string(),
        })
    }

    #[tokio::test]
    async fn test_send_to_unknown_session_is_not_found() {
        let err = send_text(State(state()), text("missing", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected() {
        let err = drive_text(State(state()), text("any", "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_empty_audio_is_rejected() {
        let query = Query(SessionQuery {
            session_id: "any".to_string(),
        });
        let err = push_audio(State(state()), query, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_stop_unknown_session_succeeds() {
        let state = state();
        for _ in 0..2 {
            let query = Query(SessionQuery {
                session_id: "gone".to_string(),
            });
            let Json(ack) = stop_session(State(state.clone()), query).await;
            assert_eq!(ack.status, "stopped");
        }
    }

    #[tokio::test]
    async fn test_unreachable_avatar_service_is_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/v1/interact", listener.local_addr().unwrap());
        drop(listener);

        let err = start_session(State(state_with(&url, Arc::default())))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_flush_and_cache_endpoints() {
        let store = Arc::new(MemoryStore::default());
        let state = state_with("ws://127.0.0.1:9/v1/interact", store.clone());
        let session_id = SessionId::from("s-1");
        state.orchestrator.aggregator().absorb(
            LogKind::Response,
            &session_id,
            "r",
            "Why this role?",
            FrameStatus::End,
        );

        let Json(counts) = cache_counts(State(state.clone()), Path("s-1".to_string())).await;
        assert_eq!((counts.responses, counts.answers), (1, 0));

        let payload = Json(FlushPayload {
            session_id: "s-1".to_string(),
            interview_record_id: 5,
        });
        let Json(flushed) = flush_responses(State(state.clone()), payload).await.unwrap();
        assert_eq!(flushed.saved_turns, 1);
        assert_eq!(store.saved.lock().unwrap()[0].1.answers, vec![""]);

        let status = discard_cache(State(state.clone()), Path("s-1".to_string())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
