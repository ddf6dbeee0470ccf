//! VOD repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::VodDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// VOD repository trait.
#[async_trait]
pub trait VodRepository: Send + Sync {
    async fn create(&self, vod: &VodDbModel) -> Result<()>;
    async fn get(&self, id: &str) -> Result<VodDbModel>;
    async fn find(&self, id: &str) -> Result<Option<VodDbModel>>;

    /// Re-point a live capture at the VOD the platform published for it.
    async fn set_external_id(&self, id: &str, external_id: &str) -> Result<()>;

    /// Persist metadata fetched after creation.
    async fn update_metadata(&self, id: &str, title: &str, duration_secs: i64) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of VodRepository.
pub struct SqlxVodRepository {
    pool: SqlitePool,
}

impl SqlxVodRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VodRepository for SqlxVodRepository {
    async fn create(&self, vod: &VodDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vods (
                id, channel_id, external_id, external_stream_id, video_type, title,
                duration_secs, folder_name, file_name, streamed_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&vod.id)
        .bind(&vod.channel_id)
        .bind(&vod.external_id)
        .bind(&vod.external_stream_id)
        .bind(&vod.video_type)
        .bind(&vod.title)
        .bind(vod.duration_secs)
        .bind(&vod.folder_name)
        .bind(&vod.file_name)
        .bind(vod.streamed_at)
        .bind(vod.created_at)
        .bind(vod.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<VodDbModel> {
        self.find(id)
            .await?
            .ok_or_else(|| Error::not_found("Vod", id))
    }

    async fn find(&self, id: &str) -> Result<Option<VodDbModel>> {
        let vod = sqlx::query_as::<_, VodDbModel>("SELECT * FROM vods WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(vod)
    }

    async fn set_external_id(&self, id: &str, external_id: &str) -> Result<()> {
        retry_on_sqlite_busy("set_vod_external_id", || async {
            sqlx::query("UPDATE vods SET external_id = ?, updated_at = ? WHERE id = ?")
                .bind(external_id)
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn update_metadata(&self, id: &str, title: &str, duration_secs: i64) -> Result<()> {
        retry_on_sqlite_busy("update_vod_metadata", || async {
            sqlx::query(
                "UPDATE vods SET title = ?, duration_secs = ?, updated_at = ? WHERE id = ?",
            )
            .bind(title)
            .bind(duration_secs)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("delete_vod", || async {
            sqlx::query("DELETE FROM vods WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}
