//! Channel repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::ChannelDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::Result;

/// Channel repository trait.
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<ChannelDbModel>>;
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<ChannelDbModel>>;

    /// Insert the channel, or refresh login and display name if the platform
    /// id is already known. Returns the stored row.
    async fn upsert(&self, channel: &ChannelDbModel) -> Result<ChannelDbModel>;

    async fn set_live(&self, id: &str, is_live: bool) -> Result<()>;
}

/// SQLx implementation of ChannelRepository.
pub struct SqlxChannelRepository {
    pool: SqlitePool,
}

impl SqlxChannelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelRepository for SqlxChannelRepository {
    async fn find(&self, id: &str) -> Result<Option<ChannelDbModel>> {
        let channel = sqlx::query_as::<_, ChannelDbModel>("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(channel)
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<ChannelDbModel>> {
        let channel =
            sqlx::query_as::<_, ChannelDbModel>("SELECT * FROM channels WHERE external_id = ?")
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(channel)
    }

    async fn upsert(&self, channel: &ChannelDbModel) -> Result<ChannelDbModel> {
        retry_on_sqlite_busy("upsert_channel", || async {
            let stored = sqlx::query_as::<_, ChannelDbModel>(
                r#"
                INSERT INTO channels (id, external_id, login, display_name, is_live, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(external_id) DO UPDATE SET
                    login = excluded.login,
                    display_name = excluded.display_name,
                    updated_at = excluded.updated_at
                RETURNING *
                "#,
            )
            .bind(&channel.id)
            .bind(&channel.external_id)
            .bind(&channel.login)
            .bind(&channel.display_name)
            .bind(channel.is_live)
            .bind(channel.created_at)
            .bind(channel.updated_at)
            .fetch_one(&self.pool)
            .await?;
            Ok(stored)
        })
        .await
    }

    async fn set_live(&self, id: &str, is_live: bool) -> Result<()> {
        retry_on_sqlite_busy("set_channel_live", || async {
            sqlx::query("UPDATE channels SET is_live = ?, updated_at = ? WHERE id = ?")
                .bind(is_live)
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}
