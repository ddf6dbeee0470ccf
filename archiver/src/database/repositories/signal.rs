//! Durable execution signals.
//!
//! A signal row outlives a restart, so a receiver that starts waiting after
//! the sender fired still sees it.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::Result;

/// Signal repository trait.
#[async_trait]
pub trait SignalRepository: Send + Sync {
    /// Store a signal. Re-sending the same channel keeps the first payload.
    async fn put(&self, execution_id: &str, channel: &str, payload: &str) -> Result<()>;

    /// Payload of a delivered signal, if any.
    async fn get(&self, execution_id: &str, channel: &str) -> Result<Option<String>>;

    /// Drop every signal addressed to an execution.
    async fn delete_for_execution(&self, execution_id: &str) -> Result<()>;
}

/// SQLx implementation of SignalRepository.
pub struct SqlxSignalRepository {
    pool: SqlitePool,
}

impl SqlxSignalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SignalRepository for SqlxSignalRepository {
    async fn put(&self, execution_id: &str, channel: &str, payload: &str) -> Result<()> {
        retry_on_sqlite_busy("put_signal", || async {
            sqlx::query(
                r#"
                INSERT INTO execution_signals (execution_id, channel, payload, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(execution_id, channel) DO NOTHING
                "#,
            )
            .bind(execution_id)
            .bind(channel)
            .bind(payload)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, execution_id: &str, channel: &str) -> Result<Option<String>> {
        let payload: Option<String> = sqlx::query_scalar(
            "SELECT payload FROM execution_signals WHERE execution_id = ? AND channel = ?",
        )
        .bind(execution_id)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payload)
    }

    async fn delete_for_execution(&self, execution_id: &str) -> Result<()> {
        retry_on_sqlite_busy("delete_signals", || async {
            sqlx::query("DELETE FROM execution_signals WHERE execution_id = ?")
                .bind(execution_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}
