//! Info JSON and thumbnails.

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ActionDeps;
use crate::pipeline::task::ArchiveTarget;
use crate::platform::{Chapter, MutedSegment, StreamInfo, VideoInfo, thumbnail_for_size};
use crate::substrate::{ActionContext, ActionError};
use crate::utils::fs;

const THUMBNAIL_SIZE: (u32, u32) = (1920, 1080);
const WEB_THUMBNAIL_SIZE: (u32, u32) = (640, 360);

#[derive(Debug, Serialize)]
struct VideoInfoFile<'a> {
    video: &'a VideoInfo,
    chapters: &'a [Chapter],
    muted_segments: &'a [MutedSegment],
    archived_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct LiveInfoFile<'a> {
    stream: &'a StreamInfo,
    archived_at: chrono::DateTime<Utc>,
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ActionError> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| ActionError::permanent(format!("serializing {}: {e}", path.display())))?;
    fs::ensure_parent_dir(path).await?;
    tokio::fs::write(path, body)
        .await
        .map_err(|e| fs::io_error("writing file", path, e))?;
    Ok(())
}

/// Fetch `url` into `dest`. Missing images are permanent, anything else
/// is retried.
async fn download_to(client: &Client, url: &str, dest: &Path) -> Result<(), ActionError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ActionError::transient(format!("fetching {url}: {e}")))?;
    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
        return Err(ActionError::permanent(format!("{url} returned {status}")));
    }
    if !status.is_success() {
        return Err(ActionError::transient(format!("{url} returned {status}")));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ActionError::transient(format!("reading {url}: {e}")))?;

    fs::ensure_parent_dir(dest).await?;
    tokio::fs::write(dest, &bytes)
        .await
        .map_err(|e| fs::io_error("writing file", dest, e))?;
    debug!(url, dest = %dest.display(), bytes = bytes.len(), "Downloaded");
    Ok(())
}

async fn download_sizes(
    client: &Client,
    template: &str,
    full: &Path,
    web: &Path,
) -> Result<(), ActionError> {
    let (width, height) = THUMBNAIL_SIZE;
    download_to(client, &thumbnail_for_size(template, width, height), full).await?;
    let (width, height) = WEB_THUMBNAIL_SIZE;
    download_to(client, &thumbnail_for_size(template, width, height), web).await
}

pub async fn save_video_info(
    deps: Arc<ActionDeps>,
    _ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (ctx, paths) = deps.load(&target).await?;
    let video_id = ctx.vod.external_id.as_str();

    let video = deps.platform.get_video(video_id).await?;
    let chapters = deps.platform.get_chapters(video_id).await.unwrap_or_else(|e| {
        warn!(video_id, error = %e, "Failed to fetch chapters");
        Vec::new()
    });
    let muted_segments = deps
        .platform
        .get_muted_segments(video_id)
        .await
        .unwrap_or_else(|e| {
            warn!(video_id, error = %e, "Failed to fetch muted segments");
            Vec::new()
        });

    write_json(
        &paths.info_json(),
        &VideoInfoFile {
            video: &video,
            chapters: &chapters,
            muted_segments: &muted_segments,
            archived_at: Utc::now(),
        },
    )
    .await?;
    deps.vods
        .update_metadata(&ctx.vod.id, &video.title, video.duration_secs)
        .await?;

    info!(
        archive_id = %target.archive_id,
        video_id,
        chapters = chapters.len(),
        muted_segments = muted_segments.len(),
        "Video info saved"
    );
    Ok(())
}

/// Save the current broadcast's info. An offline channel is the no-stream
/// sentinel.
pub async fn save_live_video_info(
    deps: Arc<ActionDeps>,
    _ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (ctx, paths) = deps.load(&target).await?;
    let login = ctx.channel.login.as_str();

    let Some(stream) = deps.platform.get_live_stream(login).await? else {
        info!(archive_id = %target.archive_id, channel = login, "Channel is not live");
        deps.coordinator.no_stream(&target.archive_id);
        return Err(ActionError::no_stream(login));
    };

    write_json(
        &paths.info_json(),
        &LiveInfoFile {
            stream: &stream,
            archived_at: Utc::now(),
        },
    )
    .await?;
    deps.vods.update_metadata(&ctx.vod.id, &stream.title, 0).await?;

    info!(archive_id = %target.archive_id, stream_id = %stream.id, "Live info saved");
    Ok(())
}

pub async fn download_thumbnails(
    deps: Arc<ActionDeps>,
    _ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (ctx, paths) = deps.load(&target).await?;
    let video = deps.platform.get_video(&ctx.vod.external_id).await?;
    if video.thumbnail_url.is_empty() {
        // Videos still processing have no thumbnail yet.
        return Err(ActionError::transient("video has no thumbnail yet"));
    }
    download_sizes(
        &deps.http,
        &video.thumbnail_url,
        &paths.thumbnail(),
        &paths.web_thumbnail(),
    )
    .await?;
    info!(archive_id = %target.archive_id, "Thumbnails downloaded");
    Ok(())
}

/// Snapshot the live preview image. Run again later to refresh it.
pub async fn download_live_thumbnail(
    deps: Arc<ActionDeps>,
    _ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (ctx, paths) = deps.load(&target).await?;
    let Some(stream) = deps.platform.get_live_stream(&ctx.channel.login).await? else {
        return Err(ActionError::permanent(format!(
            "{} is offline, no live thumbnail",
            ctx.channel.login
        )));
    };
    download_sizes(
        &deps.http,
        &stream.thumbnail_url,
        &paths.thumbnail(),
        &paths.web_thumbnail(),
    )
    .await?;
    info!(archive_id = %target.archive_id, "Live thumbnail saved");
    Ok(())
}
