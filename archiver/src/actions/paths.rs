//! On-disk artifact layout.
//!
//! Finished artifacts live under `{videos_dir}/{channel}/{folder}/` and share
//! the VOD's file stem. Work in progress is written to `temp_dir` under a
//! per-job scratch prefix and moved into place by the move tasks.

use std::path::PathBuf;

use crate::database::models::ArchiveContext;

/// Root directories artifacts are laid out under.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    pub videos_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn new(videos_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            videos_dir: videos_dir.into(),
            temp_dir: temp_dir.into(),
        }
    }

    pub fn paths(&self, ctx: &ArchiveContext) -> ArtifactPaths {
        // The stream id stays stable when correlation rewrites external_id.
        let source_id = ctx
            .vod
            .external_stream_id
            .as_deref()
            .unwrap_or(&ctx.vod.external_id);
        ArtifactPaths {
            folder: self
                .videos_dir
                .join(&ctx.channel.login)
                .join(&ctx.vod.folder_name),
            file_name: ctx.vod.file_name.clone(),
            temp_dir: self.temp_dir.clone(),
            scratch_prefix: format!("{source_id}_{}", ctx.vod.id),
        }
    }
}

/// Every path one archive job reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub folder: PathBuf,
    pub file_name: String,
    pub temp_dir: PathBuf,
    pub scratch_prefix: String,
}

impl ArtifactPaths {
    fn in_folder(&self, suffix: &str) -> PathBuf {
        self.folder.join(format!("{}{suffix}", self.file_name))
    }

    pub fn video_mp4(&self) -> PathBuf {
        self.in_folder("-video.mp4")
    }

    /// HLS playlist; its segments sit next to it.
    pub fn video_playlist(&self) -> PathBuf {
        self.in_folder("-video.m3u8")
    }

    pub fn chat_json(&self) -> PathBuf {
        self.in_folder("-chat.json")
    }

    pub fn chat_mp4(&self) -> PathBuf {
        self.in_folder("-chat.mp4")
    }

    pub fn chat_convert_json(&self) -> PathBuf {
        self.in_folder("-chat-convert.json")
    }

    pub fn thumbnail(&self) -> PathBuf {
        self.in_folder("-thumbnail.jpg")
    }

    pub fn web_thumbnail(&self) -> PathBuf {
        self.in_folder("-web_thumbnail.jpg")
    }

    pub fn info_json(&self) -> PathBuf {
        self.in_folder("-info.json")
    }

    /// Scratch file for this job, e.g. `scratch("video.mp4")`.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.temp_dir.join(format!("{}-{name}", self.scratch_prefix))
    }

    /// Raw download before conversion.
    pub fn scratch_video_source(&self) -> PathBuf {
        self.scratch("video-source.ts")
    }

    /// Converted video waiting to be moved.
    pub fn scratch_video(&self) -> PathBuf {
        self.scratch("video.mp4")
    }

    /// Directory of converted HLS output waiting to be moved.
    pub fn scratch_hls_dir(&self) -> PathBuf {
        self.scratch("hls")
    }

    pub fn scratch_chat(&self) -> PathBuf {
        self.scratch("chat.json")
    }

    /// Raw live chat capture before conversion.
    pub fn scratch_live_chat(&self) -> PathBuf {
        self.scratch("live-chat.json")
    }

    pub fn scratch_chat_render(&self) -> PathBuf {
        self.scratch("chat.mp4")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{
        ArchiveMode, ArchiveOptions, ArchiveRecordDbModel, ChannelDbModel, VideoType, VodDbModel,
    };

    fn context(stream_id: Option<&str>) -> ArchiveContext {
        let channel = ChannelDbModel::new("42", "somechannel", "SomeChannel");
        let mut vod = VodDbModel::new(&channel.id, "v123", VideoType::Archive, "title");
        vod.external_stream_id = stream_id.map(str::to_string);
        let record = ArchiveRecordDbModel::new(&vod.id, ArchiveMode::Vod, &ArchiveOptions::default());
        ArchiveContext {
            record,
            vod,
            channel,
        }
    }

    #[test]
    fn artifacts_share_the_file_stem() {
        let layout = ArtifactLayout::new("/videos", "/tmp/archiver");
        let ctx = context(None);
        let paths = layout.paths(&ctx);

        assert_eq!(paths.folder, PathBuf::from("/videos/somechannel/v123"));
        assert_eq!(paths.video_mp4(), PathBuf::from("/videos/somechannel/v123/v123-video.mp4"));
        assert_eq!(
            paths.web_thumbnail(),
            PathBuf::from("/videos/somechannel/v123/v123-web_thumbnail.jpg")
        );
        assert!(paths.scratch_chat().starts_with("/tmp/archiver"));
    }

    #[test]
    fn scratch_prefix_prefers_stream_id() {
        let layout = ArtifactLayout::new("/videos", "/tmp");
        let ctx = context(Some("s999"));
        let paths = layout.paths(&ctx);
        assert_eq!(paths.scratch_prefix, format!("s999_{}", ctx.vod.id));
        assert_eq!(
            paths.scratch_video(),
            PathBuf::from(format!("/tmp/s999_{}-video.mp4", ctx.vod.id))
        );
    }
}
