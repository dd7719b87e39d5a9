//! Shared Application State

use avatar_realtime::AvatarOrchestrator;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: AvatarOrchestrator,
}
