//! Streaming platform API.

pub mod twitch;

pub use twitch::TwitchClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// A published video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub id: String,
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub duration_secs: i64,
    /// Template with `{width}` and `{height}` placeholders.
    pub thumbnail_url: String,
    /// Stream this video was recorded from, if the platform reports it.
    pub stream_id: Option<String>,
}

/// A channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub login: String,
    pub display_name: String,
}

/// A broadcast currently on air.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
    pub title: String,
    pub started_at: DateTime<Utc>,
    /// Template with `{width}` and `{height}` placeholders.
    pub thumbnail_url: String,
}

/// A chapter marker inside a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub description: String,
    pub position_secs: i64,
    pub duration_secs: i64,
}

/// A muted span of a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutedSegment {
    pub offset_secs: i64,
    pub duration_secs: i64,
}

/// Fill a thumbnail template for the given size.
pub fn thumbnail_for_size(template: &str, width: u32, height: u32) -> String {
    template
        .replace("%{width}", &width.to_string())
        .replace("%{height}", &height.to_string())
        .replace("{width}", &width.to_string())
        .replace("{height}", &height.to_string())
}

/// Streaming platform client.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn get_video(&self, video_id: &str) -> Result<VideoInfo>;

    async fn get_chapters(&self, video_id: &str) -> Result<Vec<Chapter>>;

    async fn get_muted_segments(&self, video_id: &str) -> Result<Vec<MutedSegment>>;

    async fn get_channel(&self, login: &str) -> Result<Option<ChannelInfo>>;

    /// The channel's current broadcast, `None` when offline.
    async fn get_live_stream(&self, login: &str) -> Result<Option<StreamInfo>>;

    /// Best-effort lookup of the video published for a finished stream.
    async fn find_vod_for_stream(&self, user_id: &str, stream_id: &str) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_both_template_styles() {
        assert_eq!(
            thumbnail_for_size("https://cdn/x-%{width}x%{height}.jpg", 1920, 1080),
            "https://cdn/x-1920x1080.jpg"
        );
        assert_eq!(
            thumbnail_for_size("https://cdn/live-{width}x{height}.jpg", 320, 180),
            "https://cdn/live-320x180.jpg"
        );
    }
}
