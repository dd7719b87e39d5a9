use crate::{
    aggregator::{FlushedTurns, FragmentAggregator, FragmentSink},
    auth,
    config::AvatarConfig,
    connection::{Connection, new_request_id},
    error::SessionError,
    registry::SessionRegistry,
    session::{SessionId, SessionInfo},
    store::ResponseStore,
};
use anyhow::Context;
use avatar_realtime_types::{ClientMessage, MAX_AUDIO_FRAME_BYTES, frame_audio};
use chrono::Utc;
use secrecy::ExposeSecret;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, error, info, instrument, warn};

/// What a caller needs to attach a player to a freshly started session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartedSession {
    pub session_id: SessionId,
    pub stream_url: String,
    /// Signalling endpoint the player negotiates the stream through.
    pub api_url: String,
}

/// Outcome of handing caller input to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The session never existed or has already closed.
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    NothingToSave,
    Saved { turns: usize },
}

/// Stops a connection unless disarmed, so a cancelled `start_session` never
/// leaves a session behind.
struct StopOnDrop(Option<Arc<Connection>>);

impl StopOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if let Some(connection) = self.0.take() {
            connection.stop();
        }
    }
}

/// Marks a session's buffered text as closed and evicts whatever is still
/// unflushed once `ttl` has passed.
fn expire_cache(aggregator: &Arc<FragmentAggregator>, session_id: &SessionId, ttl: Duration) {
    aggregator.session_closed(session_id);
    let aggregator = aggregator.clone();
    let session_id = session_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        if aggregator.evict_if_closed(&session_id, ttl) {
            warn!(%session_id, "Dropped unflushed avatar turns of a closed session");
        }
    });
}

/// Public entry point for avatar sessions.
///
/// Owns the registry of live connections and the aggregator that collects
/// their streamed text, and hands flushed turns to a [`ResponseStore`].
#[derive(Clone)]
pub struct AvatarOrchestrator {
    config: Arc<AvatarConfig>,
    registry: SessionRegistry,
    aggregator: Arc<FragmentAggregator>,
    store: Arc<dyn ResponseStore>,
}

impl AvatarOrchestrator {
    pub fn new(config: AvatarConfig, store: Arc<dyn ResponseStore>) -> Self {
        Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            aggregator: Arc::new(FragmentAggregator::new()),
            store,
        }
    }

    pub fn config(&self) -> &AvatarConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn aggregator(&self) -> &FragmentAggregator {
        &self.aggregator
    }

    /// Opens a session and waits, up to the configured bound, for its stream URL.
    ///
    /// On any failure the connection is stopped and unregistered before the
    /// error is returned.
    #[instrument(name = "start_session", skip_all, fields(session_id))]
    pub async fn start_session(&self) -> Result<StartedSession, SessionError> {
        let url = auth::signed_url(
            &self.config.service_url,
            self.config.api_key.expose_secret(),
            self.config.api_secret.expose_secret(),
            Utc::now(),
        )?;

        let config = self.config.clone();
        let sink: Arc<dyn FragmentSink> = self.aggregator.clone();
        let (connection, io, readiness) = self
            .registry
            .insert_new(|session_id| {
                let (connection, io, readiness) = Connection::new(session_id, config, sink);
                (connection.clone(), (connection, io, readiness))
            })
            .await;
        let session_id = connection.session_id().clone();
        tracing::Span::current().record("session_id", session_id.as_str());
        info!("Starting avatar session");

        let guard = StopOnDrop(Some(connection.clone()));
        let registry = self.registry.clone();
        let aggregator = self.aggregator.clone();
        let cache_ttl = self.config.cache_ttl;
        let supervised = connection.clone();
        let connection_span = tracing::info_span!("avatar_connection", %session_id);
        tokio::spawn(
            async move {
                supervised.clone().connect_and_run(io, url.into()).await;
                registry
                    .remove_if_same(supervised.session_id(), &supervised)
                    .await;
                expire_cache(&aggregator, supervised.session_id(), cache_ttl);
                info!("Avatar connection finished");
            }
            .instrument(connection_span),
        );

        let outcome = match tokio::time::timeout(self.config.ready_timeout, readiness).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::ReadinessTimeout(self.config.ready_timeout)),
        };

        match outcome {
            Ok(stream_url) => {
                guard.disarm();
                info!(%stream_url, "Avatar session started");
                Ok(StartedSession {
                    session_id,
                    stream_url,
                    api_url: self.config.play_api_url.clone(),
                })
            }
            Err(e) => {
                error!(error = %e, "Avatar session failed to start");
                connection.stop();
                self.registry.remove_if_same(&session_id, &connection).await;
                guard.disarm();
                Err(e)
            }
        }
    }

    /// Asks the avatar to answer `text` through its dialogue engine.
    #[instrument(skip_all, fields(%session_id))]
    pub async fn send_text(&self, session_id: &SessionId, text: &str) -> Delivery {
        let message = ClientMessage::TextInteract {
            request_id: new_request_id(),
            vcn: self.config.vcn.clone(),
            content: text.to_string(),
        };
        self.deliver(session_id, vec![message]).await
    }

    /// Makes the avatar speak `text` verbatim.
    #[instrument(skip_all, fields(%session_id))]
    pub async fn drive_text(&self, session_id: &SessionId, text: &str) -> Delivery {
        let message = ClientMessage::TextDriver {
            request_id: new_request_id(),
            vcn: self.config.vcn.clone(),
            content: text.to_string(),
        };
        self.deliver(session_id, vec![message]).await
    }

    /// Frames `audio` and queues every frame under one request id.
    ///
    /// Concurrent calls for the same session queue their frames one request
    /// after another.
    #[instrument(skip_all, fields(%session_id, bytes = audio.len()))]
    pub async fn push_audio(&self, session_id: &SessionId, audio: &[u8]) -> Delivery {
        let request_id = new_request_id();
        let messages = frame_audio(audio, MAX_AUDIO_FRAME_BYTES)
            .iter()
            .map(|frame| ClientMessage::audio(&request_id, &self.config.audio_format, frame))
            .collect();
        self.deliver(session_id, messages).await
    }

    async fn deliver(&self, session_id: &SessionId, messages: Vec<ClientMessage>) -> Delivery {
        let Some(connection) = self.registry.get(session_id).await else {
            warn!("Session not found or already closed");
            return Delivery::NotFound;
        };
        match connection.enqueue_batch(messages).await {
            Ok(()) => Delivery::Queued,
            Err(e) => {
                warn!(error = %e, "Session closed while queueing");
                Delivery::NotFound
            }
        }
    }

    /// Removes and stops a session. Unknown ids are a no-op.
    #[instrument(skip_all, fields(%session_id))]
    pub async fn stop_session(&self, session_id: &SessionId) {
        match self.registry.remove(session_id).await {
            Some(connection) => {
                connection.stop();
                info!("Avatar session stopped");
            }
            None => info!("Stop requested for a session that is not live"),
        }
    }

    /// Stops every live session.
    pub async fn stop_all(&self) {
        let connections = self.registry.drain().await;
        if !connections.is_empty() {
            info!(count = connections.len(), "Stopping all avatar sessions");
        }
        for connection in connections {
            connection.stop();
        }
    }

    /// Hands the session's completed turns to the store.
    ///
    /// If the store fails the turns are put back, unpadded, so a retry can
    /// save them.
    #[instrument(skip_all, fields(%session_id, interview_record_id))]
    pub async fn flush_responses(
        &self,
        session_id: &SessionId,
        interview_record_id: i64,
    ) -> anyhow::Result<FlushOutcome> {
        let turns = self.aggregator.take(session_id);
        let outcome = if turns.is_empty() {
            info!("No completed turns to save");
            FlushOutcome::NothingToSave
        } else {
            self.save(session_id, interview_record_id, turns).await?
        };
        if !self.registry.contains(session_id).await {
            self.aggregator.discard(session_id);
        }
        Ok(outcome)
    }

    async fn save(
        &self,
        session_id: &SessionId,
        interview_record_id: i64,
        turns: FlushedTurns,
    ) -> anyhow::Result<FlushOutcome> {
        let paired = turns.clone().padded();
        match self.store.save_turns(interview_record_id, &paired).await {
            Ok(()) => {
                info!(turns = paired.len(), interview_record_id, "Saved avatar turns");
                Ok(FlushOutcome::Saved {
                    turns: paired.len(),
                })
            }
            Err(e) => {
                self.aggregator.restore(session_id, turns);
                if !self.registry.contains(session_id).await {
                    debug!("Session is closed; restored turns will expire");
                    expire_cache(&self.aggregator, session_id, self.config.cache_ttl);
                }
                Err(e).with_context(|| {
                    format!("failed to save turns for interview record {interview_record_id}")
                })
            }
        }
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list().await
    }

    /// Completed replies and answers waiting for a flush.
    pub fn cached_counts(&self, session_id: &SessionId) -> (usize, usize) {
        self.aggregator.cached_counts(session_id)
    }

    pub fn discard_cache(&self, session_id: &SessionId) {
        info!(%session_id, "Discarding cached avatar turns");
        self.aggregator.discard(session_id);
    }
}
