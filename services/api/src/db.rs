//! Data Access Layer
//!
//! Persists flushed avatar turns to PostgreSQL through `sqlx`.

use anyhow::Result;
use async_trait::async_trait;
use avatar_realtime::{FlushedTurns, ResponseStore};
use sqlx::PgPool;

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Stores one batch of paired replies and answers for an interview record.
    pub async fn insert_ai_responses(
        &self,
        interview_record_id: i64,
        turns: &FlushedTurns,
    ) -> Result<()> {
        let responses = serde_json::to_value(&turns.responses)?;
        let answers = serde_json::to_value(&turns.answers)?;
        sqlx::query(
            r#"
            INSERT INTO ai_responses (interview_record_id, responses, answers)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(interview_record_id)
        .bind(responses)
        .bind(answers)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ResponseStore for Db {
    async fn save_turns(&self, interview_record_id: i64, turns: &FlushedTurns) -> Result<()> {
        self.insert_ai_responses(interview_record_id, turns).await
    }
}
