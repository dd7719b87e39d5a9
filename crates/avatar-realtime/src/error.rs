use std::time::Duration;

/// Why a session failed to start or stopped being usable.
///
/// Cloneable so the same terminal reason can be handed to the readiness
/// waiter and kept on the connection for later inspection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid avatar service url: {0}")]
    InvalidUrl(String),
    #[error("failed to connect to the avatar service: {0}")]
    Connect(String),
    #[error("avatar transport failed: {0}")]
    Transport(String),
    #[error("avatar service returned error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("avatar service ended the session")]
    StoppedByService,
    #[error("avatar stream was not ready within {0:?}")]
    ReadinessTimeout(Duration),
    #[error("avatar session is closed")]
    Closed,
    #[error("failed to encode outbound message: {0}")]
    Encode(String),
}
