//! Twitch client.
//!
//! Video, channel and stream metadata come from Helix with an app access
//! token. Chapters and muted segments are only exposed through the web GQL
//! endpoint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{ChannelInfo, Chapter, MutedSegment, PlatformClient, StreamInfo, VideoInfo};
use crate::config::TwitchConfig;
use crate::{Error, Result};

const HELIX_URL: &str = "https://api.twitch.tv/helix";
const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const GQL_URL: &str = "https://gql.twitch.tv/gql";
const GQL_CLIENT_ID: &str = "kimne78kx3ncx6brgo4mv6wki5h1ko";

/// Refresh the app token this long before Twitch says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(300);

/// How many recent archives to scan when correlating a stream.
const CORRELATION_SCAN: usize = 5;

#[derive(Debug, Clone)]
struct AppToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct HelixPage<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HelixVideo {
    id: String,
    stream_id: Option<String>,
    user_id: String,
    user_login: String,
    user_name: String,
    title: String,
    created_at: DateTime<Utc>,
    duration: String,
    thumbnail_url: String,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
    id: String,
    login: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct HelixStream {
    id: String,
    user_id: String,
    user_login: String,
    user_name: String,
    title: String,
    started_at: DateTime<Utc>,
    thumbnail_url: String,
}

#[derive(Debug, Deserialize)]
struct GqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GqlError>,
}

#[derive(Debug, Deserialize)]
struct GqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GqlVideoData<T> {
    video: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlMoments {
    moments: Option<GqlEdges<GqlMoment>>,
}

#[derive(Debug, Deserialize)]
struct GqlEdges<T> {
    edges: Vec<GqlNode<T>>,
}

#[derive(Debug, Deserialize)]
struct GqlNode<T> {
    node: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlMoment {
    description: String,
    position_milliseconds: i64,
    duration_milliseconds: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlMuteInfo {
    mute_info: Option<GqlMutedConnection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlMutedConnection {
    muted_segment_connection: Option<GqlMutedNodes>,
}

#[derive(Debug, Deserialize)]
struct GqlMutedNodes {
    nodes: Vec<GqlMutedNode>,
}

#[derive(Debug, Deserialize)]
struct GqlMutedNode {
    offset: i64,
    duration: i64,
}

/// Parse a Helix duration such as `3h2m1s`.
fn parse_helix_duration(raw: &str) -> Option<i64> {
    let mut total = 0i64;
    let mut number = String::new();
    for c in raw.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let value: i64 = number.parse().ok()?;
        number.clear();
        total += match c {
            'h' => value * 3600,
            'm' => value * 60,
            's' => value,
            _ => return None,
        };
    }
    number.is_empty().then_some(total)
}

/// Twitch implementation of [`PlatformClient`].
pub struct TwitchClient {
    client: Client,
    config: TwitchConfig,
    token: Mutex<Option<AppToken>>,
}

impl TwitchClient {
    pub fn new(config: TwitchConfig) -> Result<Self> {
        if config.client_id.is_empty() || config.client_secret.is_empty() {
            return Err(Error::config("Twitch client id and secret are required"));
        }
        Ok(Self {
            client: crate::utils::http_client::build_client(Duration::from_secs(30))?,
            config,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.access_token.clone());
        }

        debug!("Requesting Twitch app access token");
        let response: TokenResponse = self
            .client
            .post(TOKEN_URL)
            .query(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *guard = Some(AppToken {
            access_token: response.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        info!(expires_in_secs = response.expires_in, "Twitch app access token refreshed");
        Ok(response.access_token)
    }

    async fn helix<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<T>> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(format!("{HELIX_URL}/{path}"))
            .query(query)
            .header("Client-Id", &self.config.client_id)
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            // Force a new token next time.
            *self.token.lock().await = None;
        }
        let page: HelixPage<T> = response.error_for_status()?.json().await?;
        Ok(page.data)
    }

    async fn gql<T: DeserializeOwned>(&self, query: String) -> Result<Option<T>> {
        let response: GqlResponse<T> = self
            .client
            .post(GQL_URL)
            .header("Client-Id", GQL_CLIENT_ID)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.data.is_none()
            && let Some(err) = response.errors.first()
        {
            return Err(Error::Platform(format!("GQL error: {}", err.message)));
        }
        Ok(response.data)
    }
}

impl From<HelixVideo> for VideoInfo {
    fn from(video: HelixVideo) -> Self {
        Self {
            duration_secs: parse_helix_duration(&video.duration).unwrap_or(0),
            id: video.id,
            user_id: video.user_id,
            user_login: video.user_login,
            user_name: video.user_name,
            title: video.title,
            created_at: video.created_at,
            thumbnail_url: video.thumbnail_url,
            stream_id: video.stream_id,
        }
    }
}

#[async_trait]
impl PlatformClient for TwitchClient {
    async fn get_video(&self, video_id: &str) -> Result<VideoInfo> {
        let videos: Vec<HelixVideo> = self.helix("videos", &[("id", video_id)]).await?;
        videos
            .into_iter()
            .next()
            .map(VideoInfo::from)
            .ok_or_else(|| Error::not_found("Video", video_id))
    }

    async fn get_chapters(&self, video_id: &str) -> Result<Vec<Chapter>> {
        let query = format!(
            r#"query {{ video(id: "{video_id}") {{ moments(momentRequestType: VIDEO_CHAPTER_MARKERS) {{ edges {{ node {{ description positionMilliseconds durationMilliseconds }} }} }} }} }}"#
        );
        let data: Option<GqlVideoData<GqlMoments>> = self.gql(query).await?;
        let chapters = data
            .and_then(|d| d.video)
            .and_then(|v| v.moments)
            .map(|m| m.edges)
            .unwrap_or_default()
            .into_iter()
            .map(|edge| Chapter {
                description: edge.node.description,
                position_secs: edge.node.position_milliseconds / 1000,
                duration_secs: edge.node.duration_milliseconds / 1000,
            })
            .collect();
        Ok(chapters)
    }

    async fn get_muted_segments(&self, video_id: &str) -> Result<Vec<MutedSegment>> {
        let query = format!(
            r#"query {{ video(id: "{video_id}") {{ muteInfo {{ mutedSegmentConnection {{ nodes {{ duration offset }} }} }} }} }}"#
        );
        let data: Option<GqlVideoData<GqlMuteInfo>> = self.gql(query).await?;
        let segments = data
            .and_then(|d| d.video)
            .and_then(|v| v.mute_info)
            .and_then(|m| m.muted_segment_connection)
            .map(|c| c.nodes)
            .unwrap_or_default()
            .into_iter()
            .map(|node| MutedSegment {
                offset_secs: node.offset,
                duration_secs: node.duration,
            })
            .collect();
        Ok(segments)
    }

    async fn get_channel(&self, login: &str) -> Result<Option<ChannelInfo>> {
        let users: Vec<HelixUser> = self.helix("users", &[("login", login)]).await?;
        Ok(users.into_iter().next().map(|user| ChannelInfo {
            id: user.id,
            login: user.login,
            display_name: user.display_name,
        }))
    }

    async fn get_live_stream(&self, login: &str) -> Result<Option<StreamInfo>> {
        let streams: Vec<HelixStream> = self.helix("streams", &[("user_login", login)]).await?;
        Ok(streams.into_iter().next().map(|stream| StreamInfo {
            id: stream.id,
            user_id: stream.user_id,
            user_login: stream.user_login,
            user_name: stream.user_name,
            title: stream.title,
            started_at: stream.started_at,
            thumbnail_url: stream.thumbnail_url,
        }))
    }

    async fn find_vod_for_stream(&self, user_id: &str, stream_id: &str) -> Result<Option<String>> {
        let first = CORRELATION_SCAN.to_string();
        let videos: Vec<HelixVideo> = self
            .helix(
                "videos",
                &[("user_id", user_id), ("type", "archive"), ("first", first.as_str())],
            )
            .await?;
        Ok(videos
            .into_iter()
            .find(|video| video.stream_id.as_deref() == Some(stream_id))
            .map(|video| video.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_helix_durations() {
        assert_eq!(parse_helix_duration("3h2m1s"), Some(3 * 3600 + 2 * 60 + 1));
        assert_eq!(parse_helix_duration("45s"), Some(45));
        assert_eq!(parse_helix_duration("10m"), Some(600));
        assert_eq!(parse_helix_duration("1x"), None);
        assert_eq!(parse_helix_duration("12"), None);
    }

    #[test]
    fn decodes_chapter_moments() {
        let body = r#"{"data":{"video":{"moments":{"edges":[
            {"node":{"description":"Just Chatting","positionMilliseconds":0,"durationMilliseconds":600000}}
        ]}}}}"#;
        let parsed: GqlResponse<GqlVideoData<GqlMoments>> = serde_json::from_str(body).unwrap();
        let moments = parsed.data.unwrap().video.unwrap().moments.unwrap();
        assert_eq!(moments.edges[0].node.duration_milliseconds, 600_000);
    }

    #[test]
    fn requires_credentials() {
        assert!(TwitchClient::new(TwitchConfig::default()).is_err());
    }
}
