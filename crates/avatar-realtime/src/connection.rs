//! One websocket link to the avatar service and its lifecycle.
//!
//! A connection moves `Opening -> Linked -> AvatarReady -> Closing -> Closed`.
//! Transport failures, remote error codes, a remote `stop` event and
//! [`Connection::stop`] all force `Closed` from any state. The readiness
//! signal fires exactly once: with the stream URL on `stream_info`, or with
//! the terminal error if the connection closes first.

use crate::{
    aggregator::FragmentSink, config::AvatarConfig, error::SessionError, session::SessionId,
    session::SessionInfo,
};
use avatar_realtime_types::{ClientMessage, InboundEvent, decode};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt, stream::SplitSink};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, protocol::Message as WsMessage},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Socket handshake issued.
    Opening,
    /// Socket open, `start` sent, sender loop running.
    Linked,
    /// Stream URL received; queued messages are being delivered.
    AvatarReady,
    Closing,
    Closed,
}

/// Resolves once with the stream URL or the reason the session never got one.
pub type Readiness = oneshot::Receiver<Result<String, SessionError>>;

/// The receiving half of the outbound queue, handed to the I/O task.
pub(crate) struct ConnectionIo {
    outbound_rx: mpsc::Receiver<ClientMessage>,
}

pub struct Connection {
    session_id: SessionId,
    created_at: DateTime<Utc>,
    config: Arc<AvatarConfig>,
    sink: Arc<dyn FragmentSink>,
    outbound: mpsc::Sender<ClientMessage>,
    /// Held while a multi-frame batch is queued so batches never interleave.
    batch: AsyncMutex<()>,
    state: watch::Sender<ConnectionState>,
    readiness: Mutex<Option<oneshot::Sender<Result<String, SessionError>>>>,
    stream_url: Mutex<Option<String>>,
    terminal_error: Mutex<Option<SessionError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    predicate: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    match rx.wait_for(predicate).await {
        Ok(state) => *state,
        Err(_) => ConnectionState::Closed,
    }
}

impl Connection {
    pub(crate) fn new(
        session_id: SessionId,
        config: Arc<AvatarConfig>,
        sink: Arc<dyn FragmentSink>,
    ) -> (Arc<Self>, ConnectionIo, Readiness) {
        let (outbound, outbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (state, _) = watch::channel(ConnectionState::Opening);
        let connection = Arc::new(Self {
            session_id,
            created_at: Utc::now(),
            config,
            sink,
            outbound,
            batch: AsyncMutex::new(()),
            state,
            readiness: Mutex::new(Some(ready_tx)),
            stream_url: Mutex::new(None),
            terminal_error: Mutex::new(None),
        });
        (connection, ConnectionIo { outbound_rx }, ready_rx)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::AvatarReady
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn stream_url(&self) -> Option<String> {
        lock(&self.stream_url).clone()
    }

    pub fn snapshot(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            state: self.state(),
            stream_url: self.stream_url(),
            created_at: self.created_at,
        }
    }

    /// Waits until the connection is closed and returns why, if it failed.
    pub async fn closed(&self) -> Option<SessionError> {
        let mut rx = self.state.subscribe();
        wait_for_state(&mut rx, |s| *s == ConnectionState::Closed).await;
        lock(&self.terminal_error).clone()
    }

    /// Queues a message for the sender loop, waiting while the queue is full.
    pub async fn enqueue(&self, message: ClientMessage) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Queues `messages` back to back; no other batch is queued in between.
    pub async fn enqueue_batch(
        &self,
        messages: impl IntoIterator<Item = ClientMessage>,
    ) -> Result<(), SessionError> {
        let _batch = self.batch.lock().await;
        for message in messages {
            self.enqueue(message).await?;
        }
        Ok(())
    }

    /// Forces the connection closed. Safe to call repeatedly and concurrently.
    pub fn stop(&self) {
        self.advance(ConnectionState::Closing);
        self.close(None);
    }

    /// Moves forward to `next`. Never moves backwards or out of `Closed`.
    fn advance(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state >= next || *state == ConnectionState::Closed {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    fn close(&self, reason: Option<SessionError>) {
        let first = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
        if first {
            match &reason {
                Some(err) => error!(session_id = %self.session_id, error = %err, "Avatar connection closed with error"),
                None => info!(session_id = %self.session_id, "Avatar connection stopped"),
            }
            *lock(&self.terminal_error) = reason.clone();
        }
        self.fire_readiness(Err(reason.unwrap_or(SessionError::Closed)));
    }

    fn fire_readiness(&self, outcome: Result<String, SessionError>) {
        if let Some(tx) = lock(&self.readiness).take() {
            // The waiter may have timed out already.
            let _ = tx.send(outcome);
        }
    }

    fn mark_ready(&self, stream_url: Option<String>) {
        if self.is_closed() {
            return;
        }
        match stream_url {
            Some(url) => {
                info!(session_id = %self.session_id, stream_url = %url, "Avatar stream is ready");
                *lock(&self.stream_url) = Some(url.clone());
                self.advance(ConnectionState::AvatarReady);
                self.fire_readiness(Ok(url));
            }
            None => {
                warn!(session_id = %self.session_id, "stream_info arrived without a stream_url");
                self.advance(ConnectionState::AvatarReady);
            }
        }
    }

    /// Opens the socket, then runs the session until it closes.
    pub(crate) async fn connect_and_run(self: Arc<Self>, io: ConnectionIo, url: String) {
        let mut state_rx = self.state.subscribe();
        let connected = tokio::select! {
            _ = wait_for_state(&mut state_rx, |s| *s == ConnectionState::Closed) => {
                debug!(session_id = %self.session_id, "Stopped before the socket opened");
                return;
            }
            result = connect_async(url.as_str()) => result,
        };
        match connected {
            Ok((ws_stream, _)) => {
                info!(session_id = %self.session_id, "Connected to avatar service");
                self.run(io, ws_stream).await;
            }
            Err(e) => self.close(Some(SessionError::Connect(e.to_string()))),
        }
    }

    /// Drives an open socket: sends `start`, spawns the sender loop and
    /// dispatches inbound frames until the connection closes.
    pub(crate) async fn run<S>(self: Arc<Self>, io: ConnectionIo, ws: S)
    where
        S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError>,
        S: Send + 'static,
    {
        let (mut ws_tx, ws_rx) = ws.split();
        if !self.advance(ConnectionState::Linked) {
            let _ = ws_tx.close().await;
            return;
        }

        let start = ClientMessage::Start {
            request_id: new_request_id(),
            vcn: self.config.vcn.clone(),
            avatar: self.config.avatar.clone(),
        };
        if let Err(e) = self.send(&mut ws_tx, &start).await {
            self.close(Some(e));
            let _ = ws_tx.close().await;
            return;
        }
        debug!(session_id = %self.session_id, "Sent start request");

        let sender = tokio::spawn(self.clone().sender_loop(io.outbound_rx, ws_tx));
        self.receive_loop(ws_rx).await;
        let _ = sender.await;
    }

    async fn receive_loop<R>(&self, mut ws_rx: R)
    where
        R: Stream<Item = Result<WsMessage, WsError>> + Unpin,
    {
        let mut state_rx = self.state.subscribe();
        loop {
            tokio::select! {
                _ = wait_for_state(&mut state_rx, |s| *s == ConnectionState::Closed) => break,
                msg = ws_rx.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(&text),
                    Some(Ok(WsMessage::Close(frame))) => {
                        self.close(Some(SessionError::Transport(format!("closed by service: {frame:?}"))));
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.close(Some(SessionError::Transport(e.to_string())));
                        break;
                    }
                    None => {
                        self.close(Some(SessionError::Transport("connection ended".to_string())));
                        break;
                    }
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let envelope = match decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Discarding malformed frame");
                return;
            }
        };
        for event in envelope.into_events() {
            match event {
                InboundEvent::RemoteError { code, message } => {
                    self.close(Some(SessionError::Remote { code, message }));
                    return;
                }
                InboundEvent::StreamInfo { stream_url } => self.mark_ready(stream_url),
                InboundEvent::AvatarStopped => {
                    self.close(Some(SessionError::StoppedByService));
                    return;
                }
                InboundEvent::Pong => debug!(session_id = %self.session_id, "Heartbeat acknowledged"),
                InboundEvent::Reply(f) => self.sink.absorb_response_fragment(
                    &self.session_id,
                    &f.request_id,
                    &f.text,
                    f.status,
                ),
                InboundEvent::Utterance(f) => self.sink.absorb_answer_fragment(
                    &self.session_id,
                    &f.request_id,
                    &f.text,
                    f.status,
                ),
                InboundEvent::Ignored => {}
                InboundEvent::Skipped { block, reason } => {
                    warn!(session_id = %self.session_id, block, reason = %reason, "Skipping malformed payload block")
                }
            }
        }
    }

    async fn sender_loop<S>(
        self: Arc<Self>,
        mut outbound_rx: mpsc::Receiver<ClientMessage>,
        mut ws_tx: SplitSink<S, WsMessage>,
    ) where
        S: Sink<WsMessage, Error = WsError>,
    {
        let mut state_rx = self.state.subscribe();
        loop {
            // Nothing leaves the queue until the avatar stream is up.
            let state = wait_for_state(&mut state_rx, |s| *s >= ConnectionState::AvatarReady).await;
            if state != ConnectionState::AvatarReady {
                break;
            }

            let next = tokio::select! {
                _ = wait_for_state(&mut state_rx, |s| *s >= ConnectionState::Closing) => break,
                next = tokio::time::timeout(self.config.heartbeat_interval, outbound_rx.recv()) => next,
            };
            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(_) if self.is_ready() => ClientMessage::Ping {
                    request_id: new_request_id(),
                },
                Err(_) => continue,
            };

            match self.send(&mut ws_tx, &message).await {
                Ok(()) => {}
                Err(SessionError::Encode(e)) => {
                    warn!(session_id = %self.session_id, error = %e, "Dropping unencodable message");
                    continue;
                }
                Err(e) => {
                    self.close(Some(e));
                    break;
                }
            }
            if message.is_audio() && !self.config.audio_frame_interval.is_zero() {
                tokio::time::sleep(self.config.audio_frame_interval).await;
            }
        }

        let _ = ws_tx.send(WsMessage::Close(None)).await;
        let _ = ws_tx.close().await;
        debug!(session_id = %self.session_id, "Sender loop finished");
    }

    async fn send<S>(
        &self,
        ws_tx: &mut SplitSink<S, WsMessage>,
        message: &ClientMessage,
    ) -> Result<(), SessionError>
    where
        S: Sink<WsMessage, Error = WsError>,
    {
        let text = message
            .encode(&self.config.app_id)
            .map_err(|e| SessionError::Encode(e.to_string()))?;
        ws_tx
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }
}

pub(crate) fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
