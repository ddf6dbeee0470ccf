//! Runtime configuration.
//!
//! Everything is read from environment variables (after `.env` is loaded by
//! `main`). Unset variables fall back to defaults; malformed ones are a
//! configuration error rather than a silent default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::logging::DEFAULT_LOG_FILTER;
use crate::pipeline::policy::PolicyTable;
use crate::substrate::WorkerQueue;
use crate::{Error, Result};

/// Per-queue concurrency limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    pub archive: usize,
    pub video_download: usize,
    pub video_convert: usize,
    pub chat_download: usize,
    pub chat_render: usize,
    pub live: usize,
    pub live_chat: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            archive: 8,
            video_download: 5,
            video_convert: 3,
            chat_download: 5,
            chat_render: 2,
            live: 16,
            live_chat: 16,
        }
    }
}

impl ConcurrencyConfig {
    pub fn limit(&self, queue: WorkerQueue) -> usize {
        match queue {
            WorkerQueue::Archive => self.archive,
            WorkerQueue::VideoDownload => self.video_download,
            WorkerQueue::VideoConvert => self.video_convert,
            WorkerQueue::ChatDownload => self.chat_download,
            WorkerQueue::ChatRender => self.chat_render,
            WorkerQueue::Live => self.live,
            WorkerQueue::LiveChat => self.live_chat,
        }
    }

    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            archive: env_parse("ARCHIVE_CONCURRENCY", defaults.archive)?,
            video_download: env_parse("VIDEO_DOWNLOAD_CONCURRENCY", defaults.video_download)?,
            video_convert: env_parse("VIDEO_CONVERT_CONCURRENCY", defaults.video_convert)?,
            chat_download: env_parse("CHAT_DOWNLOAD_CONCURRENCY", defaults.chat_download)?,
            chat_render: env_parse("CHAT_RENDER_CONCURRENCY", defaults.chat_render)?,
            live: env_parse("LIVE_CONCURRENCY", defaults.live)?,
            live_chat: env_parse("LIVE_CHAT_CONCURRENCY", defaults.live_chat)?,
        })
    }
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Also write daily-rolling files here.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
            dir: None,
        }
    }
}

/// External tool paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolsConfig {
    /// VOD video/chat download and chat render.
    pub twitch_downloader: String,
    /// Live video capture.
    pub streamlink: String,
    pub ffmpeg: String,
    /// Live chat capture.
    pub chat_downloader: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            twitch_downloader: "TwitchDownloaderCLI".to_string(),
            streamlink: "streamlink".to_string(),
            ffmpeg: "ffmpeg".to_string(),
            chat_downloader: "chat_downloader".to_string(),
        }
    }
}

/// Platform API credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    pub database_url: String,
    /// Root of the `{channel}/{folder}` artifact tree.
    pub videos_dir: PathBuf,
    /// Scratch area for in-progress downloads.
    pub temp_dir: PathBuf,
    pub log: LogConfig,
    pub concurrency: ConcurrencyConfig,
    pub policies: PolicyTable,
    /// How often long actions heartbeat.
    pub heartbeat_interval: Duration,
    /// Wait before refreshing a live thumbnail.
    pub live_thumbnail_delay: Duration,
    pub tools: ToolsConfig,
    pub twitch: TwitchConfig,
    /// Generic webhook receiving archive events.
    pub webhook_url: Option<String>,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:archiver.db?mode=rwc".to_string(),
            videos_dir: PathBuf::from("videos"),
            temp_dir: std::env::temp_dir().join("vod-archiver"),
            log: LogConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            policies: PolicyTable::default(),
            heartbeat_interval: Duration::from_secs(20),
            live_thumbnail_delay: Duration::from_secs(600),
            tools: ToolsConfig::default(),
            twitch: TwitchConfig::default(),
            webhook_url: None,
        }
    }
}

impl ArchiverConfig {
    /// Load configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `DATABASE_URL`, `VIDEOS_DIR`, `TEMP_DIR`
    /// - `LOG_FILTER`, `LOG_FORMAT` (`json` or `pretty`), `LOG_DIR`
    /// - `*_CONCURRENCY` per worker queue
    /// - `HEARTBEAT_INTERVAL_SECS`, `LIVE_THUMBNAIL_DELAY_SECS`
    /// - `TWITCH_DOWNLOADER_PATH`, `STREAMLINK_PATH`, `FFMPEG_PATH`, `CHAT_DOWNLOADER_PATH`
    /// - `TWITCH_CLIENT_ID`, `TWITCH_CLIENT_SECRET` (required)
    /// - `WEBHOOK_URL`
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let log_format = env_string("LOG_FORMAT").unwrap_or_else(|| "pretty".to_string());
        let json = match log_format.to_ascii_lowercase().as_str() {
            "json" => true,
            "pretty" | "text" => false,
            other => return Err(Error::config(format!("LOG_FORMAT: unknown format '{other}'"))),
        };

        let heartbeat_secs: u64 =
            env_parse("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval.as_secs())?;
        if heartbeat_secs == 0 {
            return Err(Error::config("HEARTBEAT_INTERVAL_SECS must be positive"));
        }

        let config = Self {
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            videos_dir: env_string("VIDEOS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.videos_dir),
            temp_dir: env_string("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            log: LogConfig {
                filter: env_string("LOG_FILTER").unwrap_or(defaults.log.filter),
                json,
                dir: env_string("LOG_DIR").map(PathBuf::from),
            },
            concurrency: ConcurrencyConfig::from_env()?,
            policies: defaults.policies,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            live_thumbnail_delay: Duration::from_secs(env_parse(
                "LIVE_THUMBNAIL_DELAY_SECS",
                defaults.live_thumbnail_delay.as_secs(),
            )?),
            tools: ToolsConfig {
                twitch_downloader: env_string("TWITCH_DOWNLOADER_PATH")
                    .unwrap_or(defaults.tools.twitch_downloader),
                streamlink: env_string("STREAMLINK_PATH").unwrap_or(defaults.tools.streamlink),
                ffmpeg: env_string("FFMPEG_PATH").unwrap_or(defaults.tools.ffmpeg),
                chat_downloader: env_string("CHAT_DOWNLOADER_PATH")
                    .unwrap_or(defaults.tools.chat_downloader),
            },
            twitch: TwitchConfig {
                client_id: env_required("TWITCH_CLIENT_ID")?,
                client_secret: env_required("TWITCH_CLIENT_SECRET")?,
            },
            webhook_url: env_string("WEBHOOK_URL"),
        };

        Ok(config)
    }
}

/// Non-empty, trimmed value of an environment variable.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_required(key: &str) -> Result<String> {
    env_string(key).ok_or_else(|| Error::config(format!("{key} is required")))
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::config(format!("{key}: invalid value '{raw}': {e}"))),
        None => Ok(default),
    }
}
