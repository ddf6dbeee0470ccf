//! Archive record repository.
//!
//! Every write is a single-row `UPDATE`, conditional where the task state
//! machine requires it, so concurrent video-side and chat-side tasks never
//! need more than SQLite's row-level isolation.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{ArchiveRecordDbModel, ExecutionSlot, TaskName, TaskStatus};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Archive record repository trait.
#[async_trait]
pub trait ArchiveRepository: Send + Sync {
    /// Insert a new archive record.
    async fn create(&self, record: &ArchiveRecordDbModel) -> Result<()>;

    /// Get an archive record by ID.
    async fn get(&self, id: &str) -> Result<ArchiveRecordDbModel>;

    /// Get an archive record by ID, `None` when it does not exist.
    async fn find(&self, id: &str) -> Result<Option<ArchiveRecordDbModel>>;

    /// Get the archive record for a VOD.
    async fn find_by_vod(&self, vod_id: &str) -> Result<Option<ArchiveRecordDbModel>>;

    /// List records still processing.
    async fn list_processing(&self) -> Result<Vec<ArchiveRecordDbModel>>;

    /// Move a task to `to` if its current status allows it.
    ///
    /// Returns false when the row is missing or the current status is not an
    /// allowed predecessor of `to`.
    async fn transition_task(&self, id: &str, task: TaskName, to: TaskStatus) -> Result<bool>;

    /// Clear `video_processing` and recompute `processing` in one statement.
    async fn clear_video_processing(&self, id: &str) -> Result<bool>;

    /// Clear `chat_processing` and recompute `processing` in one statement.
    async fn clear_chat_processing(&self, id: &str) -> Result<bool>;

    /// Claim completion. Only the first caller gets `true`.
    async fn mark_completed(&self, id: &str) -> Result<bool>;

    /// Record a sub-execution handle.
    async fn set_execution_id(&self, id: &str, slot: ExecutionSlot, execution_id: &str)
    -> Result<()>;

    /// Record when live chat capture started.
    async fn set_chat_start_timestamp(&self, id: &str, timestamp_ms: i64) -> Result<()>;

    /// Delete an archive record.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of ArchiveRepository.
pub struct SqlxArchiveRepository {
    pool: SqlitePool,
}

impl SqlxArchiveRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArchiveRepository for SqlxArchiveRepository {
    async fn create(&self, record: &ArchiveRecordDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO archive_records (
                id, vod_id, mode, archive_chat, render_chat, save_as_hls, quality,
                video_processing, chat_processing, processing,
                task_create_folder, task_save_info, task_download_thumbnail,
                task_video_download, task_video_convert, task_video_move,
                task_chat_download, task_chat_convert, task_chat_render, task_chat_move,
                pipeline_execution_id, chat_capture_execution_id, chat_archive_execution_id,
                chat_start_timestamp, completed_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.vod_id)
        .bind(&record.mode)
        .bind(record.archive_chat)
        .bind(record.render_chat)
        .bind(record.save_as_hls)
        .bind(&record.quality)
        .bind(record.video_processing)
        .bind(record.chat_processing)
        .bind(record.processing)
        .bind(&record.task_create_folder)
        .bind(&record.task_save_info)
        .bind(&record.task_download_thumbnail)
        .bind(&record.task_video_download)
        .bind(&record.task_video_convert)
        .bind(&record.task_video_move)
        .bind(&record.task_chat_download)
        .bind(&record.task_chat_convert)
        .bind(&record.task_chat_render)
        .bind(&record.task_chat_move)
        .bind(&record.pipeline_execution_id)
        .bind(&record.chat_capture_execution_id)
        .bind(&record.chat_archive_execution_id)
        .bind(record.chat_start_timestamp)
        .bind(record.completed_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<ArchiveRecordDbModel> {
        self.find(id)
            .await?
            .ok_or_else(|| Error::not_found("ArchiveRecord", id))
    }

    async fn find(&self, id: &str) -> Result<Option<ArchiveRecordDbModel>> {
        let record = sqlx::query_as::<_, ArchiveRecordDbModel>(
            "SELECT * FROM archive_records WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn find_by_vod(&self, vod_id: &str) -> Result<Option<ArchiveRecordDbModel>> {
        let record = sqlx::query_as::<_, ArchiveRecordDbModel>(
            "SELECT * FROM archive_records WHERE vod_id = ?",
        )
        .bind(vod_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_processing(&self) -> Result<Vec<ArchiveRecordDbModel>> {
        let records = sqlx::query_as::<_, ArchiveRecordDbModel>(
            "SELECT * FROM archive_records WHERE processing = 1 ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn transition_task(&self, id: &str, task: TaskName, to: TaskStatus) -> Result<bool> {
        let from = to.allowed_predecessors();
        let placeholders = vec!["?"; from.len()].join(", ");
        // Column names come from a closed enum, never from input.
        let sql = format!(
            "UPDATE archive_records SET {col} = ?, updated_at = ? WHERE id = ? AND {col} IN ({placeholders})",
            col = task.column(),
        );

        retry_on_sqlite_busy("transition_task", || async {
            let mut query = sqlx::query(&sql).bind(to.as_str()).bind(now_ms()).bind(id);
            for status in from {
                query = query.bind(status.as_str());
            }
            let result = query.execute(&self.pool).await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn clear_video_processing(&self, id: &str) -> Result<bool> {
        retry_on_sqlite_busy("clear_video_processing", || async {
            let result = sqlx::query(
                r#"
                UPDATE archive_records
                SET video_processing = 0, processing = chat_processing, updated_at = ?
                WHERE id = ? AND video_processing = 1
                "#,
            )
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn clear_chat_processing(&self, id: &str) -> Result<bool> {
        retry_on_sqlite_busy("clear_chat_processing", || async {
            let result = sqlx::query(
                r#"
                UPDATE archive_records
                SET chat_processing = 0, processing = video_processing, updated_at = ?
                WHERE id = ? AND chat_processing = 1
                "#,
            )
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn mark_completed(&self, id: &str) -> Result<bool> {
        retry_on_sqlite_busy("mark_completed", || async {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                UPDATE archive_records
                SET video_processing = 0, chat_processing = 0, processing = 0,
                    completed_at = ?, updated_at = ?
                WHERE id = ? AND completed_at IS NULL
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn set_execution_id(
        &self,
        id: &str,
        slot: ExecutionSlot,
        execution_id: &str,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE archive_records SET {} = ?, updated_at = ? WHERE id = ?",
            slot.column()
        );
        retry_on_sqlite_busy("set_execution_id", || async {
            let result = sqlx::query(&sql)
                .bind(execution_id)
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(Error::not_found("ArchiveRecord", id));
            }
            Ok(())
        })
        .await
    }

    async fn set_chat_start_timestamp(&self, id: &str, timestamp_ms: i64) -> Result<()> {
        retry_on_sqlite_busy("set_chat_start_timestamp", || async {
            sqlx::query(
                "UPDATE archive_records SET chat_start_timestamp = ?, updated_at = ? WHERE id = ?",
            )
            .bind(timestamp_ms)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("delete_archive_record", || async {
            sqlx::query("DELETE FROM archive_records WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}
