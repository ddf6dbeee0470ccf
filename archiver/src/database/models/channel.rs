//! Channel database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Channel database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChannelDbModel {
    pub id: String,
    /// Platform user id.
    pub external_id: String,
    /// Login name, also the channel directory name.
    pub login: String,
    pub display_name: String,
    /// A live archive of this channel is currently capturing.
    pub is_live: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ChannelDbModel {
    pub fn new(
        external_id: impl Into<String>,
        login: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        let now = crate::database::time::now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            external_id: external_id.into(),
            login: login.into(),
            display_name: display_name.into(),
            is_live: false,
            created_at: now,
            updated_at: now,
        }
    }
}
