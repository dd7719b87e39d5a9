use crate::aggregator::FlushedTurns;
use async_trait::async_trait;

/// Persists the reassembled conversation of a session.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Saves the paired reply/answer logs against an interview record.
    ///
    /// `turns.responses[i]` and `turns.answers[i]` belong to the same
    /// conversational turn.
    async fn save_turns(&self, interview_record_id: i64, turns: &FlushedTurns)
    -> anyhow::Result<()>;
}
