//! Chat download, live capture, conversion and render.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ActionDeps;
use super::command::{run_checked, run_command};
use crate::database::time::now_ms;
use crate::pipeline::live::{CaptureRegistry, CaptureState};
use crate::pipeline::task::ArchiveTarget;
use crate::substrate::{ActionContext, ActionError};
use crate::utils::fs;

fn arg(path: &Path) -> String {
    path.display().to_string()
}

pub async fn download_chat(
    deps: Arc<ActionDeps>,
    ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (archive, paths) = deps.load(&target).await?;
    let output = paths.scratch_chat();
    fs::ensure_dir_all(&paths.temp_dir).await?;

    let args = vec![
        "chatdownload".to_string(),
        "--id".to_string(),
        archive.vod.external_id.clone(),
        "-o".to_string(),
        arg(&output),
        "--embed-images".to_string(),
        "--temp-path".to_string(),
        arg(&paths.temp_dir),
        "--collision".to_string(),
        "Overwrite".to_string(),
    ];
    info!(archive_id = %target.archive_id, video_id = %archive.vod.external_id, "Downloading chat");
    run_checked(&deps.tools.twitch_downloader, &args, &ctx.cancel).await?;
    Ok(())
}

/// Record live chat until the video capture reports the stream ended.
pub async fn capture_live_chat(
    deps: Arc<ActionDeps>,
    ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (archive, paths) = deps.load(&target).await?;
    let captures = deps.coordinator.captures();
    let output_path = paths.scratch_live_chat();
    fs::ensure_dir_all(&paths.temp_dir).await?;

    match captures.state(&target.archive_id) {
        CaptureState::Aborted => return Err(ActionError::Cancelled),
        CaptureState::Finished => {
            warn!(archive_id = %target.archive_id, "Stream ended before chat capture started");
            return keep_existing_capture(&output_path).await;
        }
        CaptureState::Running => {}
    }

    let started = archive.record.chat_start_timestamp.unwrap_or_else(now_ms);
    deps.archives
        .set_chat_start_timestamp(&target.archive_id, started)
        .await?;

    let login = archive.channel.login.as_str();
    let args = vec![
        format!("https://www.twitch.tv/{login}"),
        "--output".to_string(),
        arg(&output_path),
    ];
    let stop = CaptureRegistry::stopped(captures.subscribe(&target.archive_id))
        .map(|state| debug!(?state, "Capture stop observed"))
        .boxed();

    info!(archive_id = %target.archive_id, channel = login, "Starting live chat capture");
    let output = run_command(&deps.tools.chat_downloader, &args, &ctx.cancel, Some(stop)).await?;

    match captures.state(&target.archive_id) {
        CaptureState::Aborted => Err(ActionError::Cancelled),
        _ if output.stopped || output.success() => {
            info!(
                archive_id = %target.archive_id,
                duration_secs = output.duration.as_secs(),
                "Live chat capture finished"
            );
            ensure_capture_file(&output_path).await
        }
        _ => Err(output.failure(&deps.tools.chat_downloader)),
    }
}

/// Settle a live chat capture that a stop or restart interrupted, keeping
/// whatever it wrote.
pub async fn finish_live_chat(
    deps: Arc<ActionDeps>,
    _ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (_, paths) = deps.load(&target).await?;
    let output_path = paths.scratch_live_chat();
    keep_existing_capture(&output_path).await?;
    info!(archive_id = %target.archive_id, "Keeping interrupted live chat capture");
    Ok(())
}

/// Succeed only if a capture already wrote its file.
async fn keep_existing_capture(path: &Path) -> Result<(), ActionError> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        Ok(())
    } else {
        Err(ActionError::permanent(format!(
            "no live chat was captured: {}",
            path.display()
        )))
    }
}

/// A capture that ran on a stream without chat still produces an (empty)
/// file.
async fn ensure_capture_file(path: &Path) -> Result<(), ActionError> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(());
    }
    tokio::fs::write(path, b"[]")
        .await
        .map_err(|e| fs::io_error("writing file", path, e))?;
    Ok(())
}

/// One message as written by the live chat capture tool.
#[derive(Debug, Clone, Deserialize)]
pub struct CapturedMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Unix epoch microseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub author: CapturedAuthor,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapturedAuthor {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub colour: Option<String>,
}

/// Chat file in the downloader's format, which the renderer reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatFile {
    pub streamer: ChatStreamer,
    pub video: ChatVideo,
    pub comments: Vec<ChatComment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatStreamer {
    pub name: String,
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatVideo {
    pub title: String,
    pub id: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatComment {
    #[serde(rename = "_id")]
    pub id: String,
    pub created_at: String,
    pub channel_id: String,
    pub content_offset_seconds: f64,
    pub commenter: ChatCommenter,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCommenter {
    pub display_name: String,
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub body: String,
    pub user_color: Option<String>,
    pub fragments: Vec<ChatFragment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatFragment {
    pub text: String,
}

/// Parse a raw capture.
///
/// The capture tool writes one JSON array and may be stopped before it
/// closes it, so an unterminated array yields every complete message. An
/// empty file holds no messages.
pub fn parse_captured_chat(raw: &[u8]) -> Result<Vec<CapturedMessage>, serde_json::Error> {
    let err = match serde_json::from_slice(raw) {
        Ok(messages) => return Ok(messages),
        Err(err) if err.is_eof() => err,
        Err(err) => return Err(err),
    };

    let raw = raw.trim_ascii();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let Some(mut rest) = raw.strip_prefix(b"[") else {
        return Err(err);
    };
    let mut messages = Vec::new();
    loop {
        rest = rest.trim_ascii_start();
        rest = rest.strip_prefix(b",").unwrap_or(rest).trim_ascii_start();
        if rest.is_empty() {
            break;
        }
        let mut stream = serde_json::Deserializer::from_slice(rest).into_iter::<CapturedMessage>();
        match stream.next() {
            Some(Ok(message)) => {
                messages.push(message);
                rest = &rest[stream.byte_offset()..];
            }
            Some(Err(e)) if e.is_eof() => break,
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(messages)
}

/// Convert captured messages, offsetting each from `start_ms`.
///
/// Messages from before the start clamp to offset zero; messages without
/// text are dropped.
pub fn convert_captured_chat(
    messages: Vec<CapturedMessage>,
    start_ms: i64,
    streamer: ChatStreamer,
    video: ChatVideo,
) -> ChatFile {
    let channel_id = streamer.id.to_string();
    let comments = messages
        .into_iter()
        .enumerate()
        .filter_map(|(index, message)| {
            let body = message.message.filter(|body| !body.is_empty())?;
            let sent_ms = message.timestamp / 1000;
            let offset = ((sent_ms - start_ms).max(0)) as f64 / 1000.0;
            let created_at = chrono::DateTime::from_timestamp_millis(sent_ms)
                .map(|at| at.to_rfc3339())
                .unwrap_or_default();
            let name = message.author.name.unwrap_or_default();
            Some(ChatComment {
                id: message.message_id.unwrap_or_else(|| format!("captured-{index}")),
                created_at,
                channel_id: channel_id.clone(),
                content_offset_seconds: offset,
                commenter: ChatCommenter {
                    display_name: message.author.display_name.unwrap_or_else(|| name.clone()),
                    id: message.author.id.unwrap_or_default(),
                    name,
                },
                message: ChatMessage {
                    fragments: vec![ChatFragment { text: body.clone() }],
                    body,
                    user_color: message.author.colour,
                },
            })
        })
        .collect::<Vec<_>>();

    let end = comments
        .last()
        .map(|comment| comment.content_offset_seconds)
        .unwrap_or(0.0)
        .max(video.end);
    ChatFile {
        streamer,
        video: ChatVideo { end, ..video },
        comments,
    }
}

/// Convert the raw live capture into the downloader's chat format.
pub async fn convert_live_chat(
    deps: Arc<ActionDeps>,
    _ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (archive, paths) = deps.load(&target).await?;
    let source = paths.scratch_live_chat();
    let raw = tokio::fs::read(&source)
        .await
        .map_err(|e| fs::io_error("reading captured chat", &source, e))?;
    let messages = parse_captured_chat(&raw)
        .map_err(|e| ActionError::permanent(format!("malformed captured chat: {e}")))?;

    let start_ms = archive
        .record
        .chat_start_timestamp
        .or(archive.vod.streamed_at)
        .or_else(|| messages.first().map(|m| m.timestamp / 1000))
        .unwrap_or(0);
    if archive.record.chat_start_timestamp.is_none() {
        warn!(archive_id = %target.archive_id, "No chat start timestamp, using fallback");
    }

    let count = messages.len();
    let chat = convert_captured_chat(
        messages,
        start_ms,
        ChatStreamer {
            name: archive.channel.login.clone(),
            id: archive.channel.external_id.parse().unwrap_or(0),
        },
        ChatVideo {
            title: archive.vod.title.clone(),
            id: archive.vod.external_id.clone(),
            start: 0.0,
            end: archive.vod.duration_secs as f64,
        },
    );

    let output = paths.scratch_chat();
    let body = serde_json::to_vec(&chat)
        .map_err(|e| ActionError::permanent(format!("serializing chat: {e}")))?;
    tokio::fs::write(&output, body)
        .await
        .map_err(|e| fs::io_error("writing converted chat", &output, e))?;

    info!(
        archive_id = %target.archive_id,
        captured = count,
        comments = chat.comments.len(),
        "Live chat converted"
    );
    Ok(())
}

pub async fn render_chat(
    deps: Arc<ActionDeps>,
    ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (_, paths) = deps.load(&target).await?;
    let input = paths.scratch_chat();
    if !tokio::fs::try_exists(&input).await.unwrap_or(false) {
        return Err(ActionError::permanent(format!(
            "chat to render missing: {}",
            input.display()
        )));
    }

    let args = vec![
        "chatrender".to_string(),
        "-i".to_string(),
        arg(&input),
        "-o".to_string(),
        arg(&paths.scratch_chat_render()),
        "-h".to_string(),
        "1080".to_string(),
        "-w".to_string(),
        "422".to_string(),
        "--framerate".to_string(),
        "30".to_string(),
        "--font-size".to_string(),
        "18".to_string(),
        "--temp-path".to_string(),
        arg(&paths.temp_dir),
        "--collision".to_string(),
        "Overwrite".to_string(),
    ];
    info!(archive_id = %target.archive_id, "Rendering chat");
    run_checked(&deps.tools.twitch_downloader, &args, &ctx.cancel).await?;
    Ok(())
}
