//! Folder creation and the final moves into the archive tree.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::ActionDeps;
use crate::pipeline::task::ArchiveTarget;
use crate::substrate::{ActionContext, ActionError};
use crate::utils::fs;

pub async fn create_folder(
    deps: Arc<ActionDeps>,
    _ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (_, paths) = deps.load(&target).await?;
    fs::ensure_dir_all(&paths.folder).await?;
    fs::ensure_dir_all(&paths.temp_dir).await?;
    info!(archive_id = %target.archive_id, folder = %paths.folder.display(), "Archive folder ready");
    Ok(())
}

/// Move a scratch file into place. A file already at the destination with
/// no source left means a previous attempt got this far.
async fn move_into_place(source: &Path, dest: &Path) -> Result<(), ActionError> {
    if !tokio::fs::try_exists(source).await.unwrap_or(false)
        && tokio::fs::try_exists(dest).await.unwrap_or(false)
    {
        debug!(dest = %dest.display(), "Already moved");
        return Ok(());
    }
    fs::move_file(source, dest).await?;
    Ok(())
}

pub async fn move_video(
    deps: Arc<ActionDeps>,
    _ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (ctx, paths) = deps.load(&target).await?;

    if ctx.record.save_as_hls {
        let hls_dir = paths.scratch_hls_dir();
        if tokio::fs::try_exists(&hls_dir).await.unwrap_or(false) {
            fs::move_dir_contents(&hls_dir, &paths.folder).await?;
        } else if !tokio::fs::try_exists(paths.video_playlist()).await.unwrap_or(false) {
            return Err(ActionError::permanent(format!(
                "converted HLS output missing: {}",
                hls_dir.display()
            )));
        }
    } else {
        move_into_place(&paths.scratch_video(), &paths.video_mp4()).await?;
    }

    let removed =
        fs::remove_with_prefix(&paths.temp_dir, &format!("{}-video", paths.scratch_prefix)).await?;
    info!(archive_id = %target.archive_id, scratch_removed = removed, "Video moved into archive");
    Ok(())
}

pub async fn move_chat(
    deps: Arc<ActionDeps>,
    _ctx: ActionContext,
    target: ArchiveTarget,
) -> Result<(), ActionError> {
    let (ctx, paths) = deps.load(&target).await?;

    if ctx.record.is_live() {
        move_into_place(&paths.scratch_live_chat(), &paths.chat_json()).await?;
        move_into_place(&paths.scratch_chat(), &paths.chat_convert_json()).await?;
    } else {
        move_into_place(&paths.scratch_chat(), &paths.chat_json()).await?;
    }
    if ctx.record.render_chat {
        move_into_place(&paths.scratch_chat_render(), &paths.chat_mp4()).await?;
    }

    let prefix = &paths.scratch_prefix;
    let mut removed = fs::remove_with_prefix(&paths.temp_dir, &format!("{prefix}-chat")).await?;
    removed += fs::remove_with_prefix(&paths.temp_dir, &format!("{prefix}-live-chat")).await?;
    info!(archive_id = %target.archive_id, scratch_removed = removed, "Chat moved into archive");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_move_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("scratch-video.mp4");
        let dest = dir.path().join("archive/video.mp4");
        tokio::fs::write(&source, b"data").await.unwrap();

        move_into_place(&source, &dest).await.unwrap();
        move_into_place(&source, &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn missing_source_and_destination_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let err = move_into_place(&dir.path().join("a"), &dir.path().join("b"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
