//! Reassembly of streamed reply and recognition text.

use crate::session::SessionId;
use avatar_realtime_types::FrameStatus;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Receives streamed text fragments from a connection.
pub trait FragmentSink: Send + Sync {
    /// A piece of the avatar's synthesized reply.
    fn absorb_response_fragment(
        &self,
        session_id: &SessionId,
        request_id: &str,
        text: &str,
        status: FrameStatus,
    );

    /// A piece of the recognized user utterance.
    fn absorb_answer_fragment(
        &self,
        session_id: &SessionId,
        request_id: &str,
        text: &str,
        status: FrameStatus,
    );
}

/// Which of a session's two logs a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Response,
    Answer,
}

/// The completed logs taken from a session.
///
/// [`FragmentAggregator::take`] hands them back as recorded;
/// [`FragmentAggregator::flush`] pads the shorter side with empty strings so
/// both vectors have the same length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushedTurns {
    pub responses: Vec<String>,
    pub answers: Vec<String>,
}

impl FlushedTurns {
    pub fn len(&self) -> usize {
        self.responses.len().max(self.answers.len())
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty() && self.answers.is_empty()
    }

    /// Pairs every reply with an answer, filling gaps with empty strings.
    pub fn padded(mut self) -> Self {
        let len = self.len();
        self.responses.resize(len, String::new());
        self.answers.resize(len, String::new());
        self
    }
}

#[derive(Default)]
struct TextLog {
    pending: HashMap<String, Vec<String>>,
    completed: Vec<String>,
}

impl TextLog {
    fn absorb(&mut self, request_id: &str, text: &str, status: FrameStatus) -> bool {
        self.pending
            .entry(request_id.to_string())
            .or_default()
            .push(text.to_string());
        if !status.is_terminal() {
            return false;
        }
        match self.pending.remove(request_id) {
            Some(parts) => {
                self.completed.push(parts.concat());
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct SessionLogs {
    responses: TextLog,
    answers: TextLog,
    /// Set once the session's connection has ended.
    closed_at: Option<Instant>,
}

impl SessionLogs {
    fn log_mut(&mut self, kind: LogKind) -> &mut TextLog {
        match kind {
            LogKind::Response => &mut self.responses,
            LogKind::Answer => &mut self.answers,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-session accumulation of streamed text into completed units.
///
/// The outer map is only locked long enough to find a session's entry; all
/// fragment work happens under that session's own lock, so sessions never
/// contend with each other.
#[derive(Default)]
pub struct FragmentAggregator {
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<SessionLogs>>>>,
}

impl FragmentAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, session_id: &SessionId) -> Arc<Mutex<SessionLogs>> {
        lock(&self.sessions)
            .entry(session_id.clone())
            .or_default()
            .clone()
    }

    fn existing(&self, session_id: &SessionId) -> Option<Arc<Mutex<SessionLogs>>> {
        lock(&self.sessions).get(session_id).cloned()
    }

    /// Appends a fragment to its pending group, completing the group when
    /// `status` is terminal.
    pub fn absorb(
        &self,
        kind: LogKind,
        session_id: &SessionId,
        request_id: &str,
        text: &str,
        status: FrameStatus,
    ) {
        let logs = self.entry(session_id);
        let completed = lock(&logs).log_mut(kind).absorb(request_id, text, status);
        if completed {
            debug!(%session_id, request_id, ?kind, "completed a streamed unit");
        }
    }

    /// Takes both completed logs exactly as recorded, without padding.
    ///
    /// Groups still waiting for their terminal fragment stay pending.
    pub fn take(&self, session_id: &SessionId) -> FlushedTurns {
        let Some(logs) = self.existing(session_id) else {
            return FlushedTurns::default();
        };
        let mut logs = lock(&logs);
        FlushedTurns {
            responses: std::mem::take(&mut logs.responses.completed),
            answers: std::mem::take(&mut logs.answers.completed),
        }
    }

    /// Takes both completed logs, padded to equal length with empty strings.
    pub fn flush(&self, session_id: &SessionId) -> FlushedTurns {
        self.take(session_id).padded()
    }

    /// Puts turns returned by [`FragmentAggregator::take`] back in front of
    /// anything completed since.
    ///
    /// Padded turns must not be restored: their filler would become real
    /// entries and shift later pairs.
    pub fn restore(&self, session_id: &SessionId, turns: FlushedTurns) {
        if turns.is_empty() {
            return;
        }
        let logs = self.entry(session_id);
        let mut logs = lock(&logs);
        let newer = std::mem::replace(&mut logs.responses.completed, turns.responses);
        logs.responses.completed.extend(newer);
        let newer = std::mem::replace(&mut logs.answers.completed, turns.answers);
        logs.answers.completed.extend(newer);
    }

    /// Number of completed replies and answers waiting to be flushed.
    pub fn cached_counts(&self, session_id: &SessionId) -> (usize, usize) {
        self.existing(session_id)
            .map(|logs| {
                let logs = lock(&logs);
                (logs.responses.completed.len(), logs.answers.completed.len())
            })
            .unwrap_or((0, 0))
    }

    /// Drops everything buffered for a session, pending groups included.
    pub fn discard(&self, session_id: &SessionId) {
        lock(&self.sessions).remove(session_id);
    }

    /// Records that the session's connection has ended.
    ///
    /// Pending groups can no longer complete and are dropped. Completed turns
    /// stay available for a flush until [`FragmentAggregator::evict_if_closed`]
    /// removes them; a session with nothing completed is removed at once.
    pub fn session_closed(&self, session_id: &SessionId) {
        let mut sessions = lock(&self.sessions);
        let Some(logs) = sessions.get(session_id).cloned() else {
            return;
        };
        let mut logs = lock(&logs);
        logs.responses.pending.clear();
        logs.answers.pending.clear();
        if logs.responses.completed.is_empty() && logs.answers.completed.is_empty() {
            sessions.remove(session_id);
        } else {
            logs.closed_at = Some(Instant::now());
        }
    }

    /// Removes a closed session once it has been closed for at least `ttl`.
    ///
    /// Returns whether anything was evicted. Live sessions are never touched.
    pub fn evict_if_closed(&self, session_id: &SessionId, ttl: Duration) -> bool {
        let mut sessions = lock(&self.sessions);
        let expired = sessions.get(session_id).is_some_and(|logs| {
            lock(logs)
                .closed_at
                .is_some_and(|closed_at| closed_at.elapsed() >= ttl)
        });
        if expired {
            sessions.remove(session_id);
            debug!(%session_id, "evicted unflushed turns of a closed session");
        }
        expired
    }

    /// Number of sessions with buffered state.
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }
}

impl FragmentSink for FragmentAggregator {
    fn absorb_response_fragment(
        &self,
        session_id: &SessionId,
        request_id: &str,
        text: &str,
        status: FrameStatus,
    ) {
        self.absorb(LogKind::Response, session_id, request_id, text, status);
    }

    fn absorb_answer_fragment(
        &self,
        session_id: &SessionId,
        request_id: &str,
        text: &str,
        status: FrameStatus,
    ) {
        self.absorb(LogKind::Answer, session_id, request_id, text, status);
    }
}
