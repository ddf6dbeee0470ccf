//! Video download, live capture and conversion.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::ActionDeps;
use super::command::{run_checked, run_command};
use crate::pipeline::task::ArchiveTarget;
use crate::substrate::{ActionContext, ActionError};
use crate::utils::fs;

/// Streamlink's message for an offline channel.
const NO_PLAYABLE_STREAMS: &str = "No playable streams found";

fn arg(path: &Path) -> String {
    path.display().to_string()
}

async fn non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.len() > 0)
}

pub async fn download_video(
    deps: Arc<ActionDeps>,
    ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (archive, paths) = deps.load(&target).await?;
    let output = paths.scratch_video_source();
    fs::ensure_dir_all(&paths.temp_dir).await?;

    let mut args = vec![
        "videodownload".to_string(),
        "--id".to_string(),
        archive.vod.external_id.clone(),
        "-o".to_string(),
        arg(&output),
        "--temp-path".to_string(),
        arg(&paths.temp_dir),
        "--collision".to_string(),
        "Overwrite".to_string(),
    ];
    if archive.record.quality != "best" {
        args.push("-q".to_string());
        args.push(archive.record.quality.clone());
    }

    info!(
        archive_id = %target.archive_id,
        video_id = %archive.vod.external_id,
        attempt = ctx.attempt,
        "Downloading video"
    );
    run_checked(&deps.tools.twitch_downloader, &args, &ctx.cancel).await?;
    if !non_empty(&output).await {
        return Err(ActionError::transient("video download produced no output"));
    }
    Ok(())
}

/// Capture the broadcast until it ends.
///
/// Ending the capture (for any reason other than termination) stops the
/// live chat capture. An offline channel is the no-stream sentinel.
pub async fn download_live_video(
    deps: Arc<ActionDeps>,
    ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (archive, paths) = deps.load(&target).await?;
    let login = archive.channel.login.clone();
    let output_path = paths.scratch_video_source();
    fs::ensure_dir_all(&paths.temp_dir).await?;

    let args = vec![
        format!("https://twitch.tv/{login}"),
        archive.record.quality.clone(),
        "-o".to_string(),
        arg(&output_path),
        "--force".to_string(),
        "--twitch-disable-ads".to_string(),
        "--hls-live-restart".to_string(),
    ];

    info!(archive_id = %target.archive_id, channel = %login, "Starting live capture");
    let result = run_command(&deps.tools.streamlink, &args, &ctx.cancel, None).await;

    match result {
        Err(ActionError::Cancelled) => Err(ActionError::Cancelled),
        Ok(output) if output.mentions(NO_PLAYABLE_STREAMS) => {
            info!(archive_id = %target.archive_id, channel = %login, "No playable stream");
            deps.coordinator.no_stream(&target.archive_id);
            Err(ActionError::no_stream(login))
        }
        result => {
            deps.coordinator.stream_ended(&archive).await;
            let output = result?;
            if output.success() || non_empty(&output_path).await {
                if !output.success() {
                    warn!(archive_id = %target.archive_id, "Live capture exited with an error after recording");
                }
                info!(
                    archive_id = %target.archive_id,
                    duration_secs = output.duration.as_secs(),
                    "Live capture finished"
                );
                Ok(())
            } else {
                Err(output.failure(&deps.tools.streamlink))
            }
        }
    }
}

/// Settle a live capture that a stop or restart interrupted.
///
/// The capture is not restarted: that would overwrite what was recorded,
/// or find the channel offline and roll the job back. The broadcast is
/// treated as ended and the partial recording is kept.
pub async fn finish_live_video(
    deps: Arc<ActionDeps>,
    _ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (archive, paths) = deps.load(&target).await?;
    deps.coordinator.stream_ended(&archive).await;

    let output_path = paths.scratch_video_source();
    if non_empty(&output_path).await {
        info!(archive_id = %target.archive_id, "Keeping interrupted live capture");
        Ok(())
    } else {
        Err(ActionError::permanent(format!(
            "interrupted live capture recorded nothing: {}",
            output_path.display()
        )))
    }
}

/// Remux the downloaded source into MP4 or HLS.
pub async fn convert_video(
    deps: Arc<ActionDeps>,
    ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (archive, paths) = deps.load(&target).await?;
    let source = paths.scratch_video_source();
    if !non_empty(&source).await {
        let converted = if archive.record.save_as_hls {
            paths.scratch_hls_dir().join(format!("{}-video.m3u8", paths.file_name))
        } else {
            paths.scratch_video()
        };
        if non_empty(&converted).await {
            return Ok(());
        }
        return Err(ActionError::permanent(format!(
            "downloaded video missing: {}",
            source.display()
        )));
    }

    let mut args = vec![
        "-hide_banner".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        arg(&source),
        "-c".to_string(),
        "copy".to_string(),
    ];
    if archive.record.save_as_hls {
        let dir = paths.scratch_hls_dir();
        fs::ensure_dir_all(&dir).await?;
        let stem = format!("{}-video", paths.file_name);
        args.extend([
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            "10".to_string(),
            "-hls_playlist_type".to_string(),
            "vod".to_string(),
            "-hls_segment_filename".to_string(),
            arg(&dir.join(format!("{stem}%05d.ts"))),
            arg(&dir.join(format!("{stem}.m3u8"))),
        ]);
    } else {
        args.extend([
            "-bsf:a".to_string(),
            "aac_adtstoasc".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            arg(&paths.scratch_video()),
        ]);
    }

    info!(archive_id = %target.archive_id, hls = archive.record.save_as_hls, "Converting video");
    run_checked(&deps.tools.ffmpeg, &args, &ctx.cancel).await?;

    if let Err(e) = tokio::fs::remove_file(&source).await {
        warn!(archive_id = %target.archive_id, error = %e, "Failed to remove downloaded source");
    }
    Ok(())
}
