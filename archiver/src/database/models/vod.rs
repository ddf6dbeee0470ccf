//! VOD database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Kind of video a VOD row describes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VideoType {
    /// A past broadcast published by the platform.
    Archive,
    /// A broadcast captured while it was live.
    Live,
}

impl VideoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Live => "live",
        }
    }
}

/// VOD database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VodDbModel {
    pub id: String,
    pub channel_id: String,
    /// Platform video id, or the stream id for live captures.
    pub external_id: String,
    /// Platform stream id (live only).
    pub external_stream_id: Option<String>,
    /// Type: archive, live
    pub video_type: String,
    pub title: String,
    pub duration_secs: i64,
    /// Folder under the channel directory holding the artifacts.
    pub folder_name: String,
    /// File stem shared by every artifact.
    pub file_name: String,
    /// Unix epoch milliseconds when the broadcast started.
    pub streamed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl VodDbModel {
    pub fn new(
        channel_id: impl Into<String>,
        external_id: impl Into<String>,
        video_type: VideoType,
        title: impl Into<String>,
    ) -> Self {
        let now = crate::database::time::now_ms();
        let external_id = external_id.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            folder_name: external_id.clone(),
            file_name: external_id.clone(),
            external_id,
            external_stream_id: None,
            video_type: video_type.as_str().to_string(),
            title: title.into(),
            duration_secs: 0,
            streamed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
