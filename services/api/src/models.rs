//! API Models
//!
//! Request and response bodies of the avatar endpoints, with `utoipa` schemas
//! for the OpenAPI document.

use avatar_realtime::{SessionInfo, StartedSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct StartSessionResponse {
    pub session_id: String,
    #[schema(example = "xrtc://avatar.example.com/stream/abc")]
    pub stream_url: String,
    #[schema(example = "https://rtc-api.xf-yun.com/v1/rtc/play/")]
    pub api_url: String,
}

impl From<StartedSession> for StartSessionResponse {
    fn from(started: StartedSession) -> Self {
        Self {
            session_id: started.session_id.to_string(),
            stream_url: started.stream_url,
            api_url: started.api_url,
        }
    }
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct TextPayload {
    pub session_id: String,
    #[schema(example = "Tell me about your last project.")]
    pub text: String,
}

#[derive(Deserialize, IntoParams, Debug)]
#[into_params(parameter_in = Query)]
pub struct SessionQuery {
    pub session_id: String,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct FlushPayload {
    pub session_id: String,
    #[schema(example = 1024)]
    pub interview_record_id: i64,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct FlushResponse {
    /// Number of turns written; zero when nothing was cached.
    pub saved_turns: usize,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct AckResponse {
    pub session_id: String,
    #[schema(example = "queued")]
    pub status: String,
}

impl AckResponse {
    pub fn new(session_id: impl Into<String>, status: &str) -> Self {
        Self {
            session_id: session_id.into(),
            status: status.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    #[schema(example = "avatar_ready")]
    pub state: String,
    pub stream_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<SessionInfo> for SessionSummary {
    fn from(info: SessionInfo) -> Self {
        let state = serde_json::to_value(info.state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            session_id: info.session_id.to_string(),
            state,
            stream_url: info.stream_url,
            created_at: info.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct CacheCounts {
    pub session_id: String,
    pub responses: usize,
    pub answers: usize,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
