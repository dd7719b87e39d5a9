//! Real-time avatar interaction sessions.
//!
//! An [`AvatarOrchestrator`] opens one websocket [`Connection`] per session to
//! the remote avatar service, drives the `start` handshake, streams caller
//! text and audio through a bounded outbound queue, and reassembles the
//! service's streamed reply and recognition text through a
//! [`FragmentAggregator`] until the caller flushes it to a [`ResponseStore`].

pub mod aggregator;
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod store;

pub use avatar_realtime_types::FrameStatus;
pub use aggregator::{FlushedTurns, FragmentAggregator, FragmentSink, LogKind};
pub use config::AvatarConfig;
pub use connection::{Connection, ConnectionState};
pub use error::SessionError;
pub use orchestrator::{AvatarOrchestrator, Delivery, FlushOutcome, StartedSession};
pub use registry::SessionRegistry;
pub use session::{SessionId, SessionInfo};
pub use store::ResponseStore;
