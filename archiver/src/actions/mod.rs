//! Concrete action handlers.
//!
//! Each handler loads the job's context fresh, does one piece of work with
//! an external tool, the platform API or the filesystem, and reports an
//! [`ActionError`] classified for the retry policy.

pub mod chat;
pub mod command;
pub mod fs;
pub mod metadata;
pub mod paths;
pub mod video;

use reqwest::Client;
use std::future::Future;
use std::sync::Arc;

use crate::config::ToolsConfig;
use crate::database::models::ArchiveContext;
use crate::database::repositories::{
    ArchiveRepository, ChannelRepository, VodRepository, load_archive_context,
};
use crate::pipeline::live::LiveCoordinator;
use crate::pipeline::task::{ActionKind, ActionRegistry, ArchiveTarget};
use crate::platform::PlatformClient;
use crate::substrate::{ActionContext, ActionError};
use paths::{ArtifactLayout, ArtifactPaths};

/// Everything the default handlers need.
pub struct ActionDeps {
    pub archives: Arc<dyn ArchiveRepository>,
    pub vods: Arc<dyn VodRepository>,
    pub channels: Arc<dyn ChannelRepository>,
    pub platform: Arc<dyn PlatformClient>,
    pub coordinator: Arc<LiveCoordinator>,
    pub layout: ArtifactLayout,
    pub tools: ToolsConfig,
    /// Client for thumbnail downloads.
    pub http: Client,
}

impl ActionDeps {
    /// Load the job's record, VOD and channel.
    ///
    /// A record deleted while the action was queued reads as cancellation.
    pub async fn load(&self, target: &ArchiveTarget) -> Result<(ArchiveContext, ArtifactPaths), ActionError> {
        let ctx = load_archive_context(
            self.archives.as_ref(),
            self.vods.as_ref(),
            self.channels.as_ref(),
            &target.archive_id,
        )
        .await?
        .ok_or(ActionError::Cancelled)?;
        let paths = self.layout.paths(&ctx);
        Ok((ctx, paths))
    }
}

/// Bind a handler function to the shared dependencies.
fn bind<F, Fut>(
    deps: &Arc<ActionDeps>,
    handler: F,
) -> impl Fn(ActionContext, ArchiveTarget) -> Fut + Send + Sync + 'static
where
    F: Fn(Arc<ActionDeps>, ActionContext, ArchiveTarget) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
{
    let deps = deps.clone();
    move |ctx, target| handler(deps.clone(), ctx, target)
}

/// Register the production handler for every [`ActionKind`].
pub fn register_default_actions(registry: &mut ActionRegistry, deps: Arc<ActionDeps>) {
    registry
        .register_fn(ActionKind::CreateFolder, bind(&deps, fs::create_folder))
        .register_fn(ActionKind::SaveVideoInfo, bind(&deps, metadata::save_video_info))
        .register_fn(ActionKind::SaveLiveVideoInfo, bind(&deps, metadata::save_live_video_info))
        .register_fn(ActionKind::DownloadThumbnails, bind(&deps, metadata::download_thumbnails))
        .register_fn(
            ActionKind::DownloadLiveThumbnail,
            bind(&deps, metadata::download_live_thumbnail),
        )
        .register_fn(ActionKind::DownloadVideo, bind(&deps, video::download_video))
        .register_fn(ActionKind::DownloadLiveVideo, bind(&deps, video::download_live_video))
        .register_fn(ActionKind::FinishLiveVideo, bind(&deps, video::finish_live_video))
        .register_fn(ActionKind::ConvertVideo, bind(&deps, video::convert_video))
        .register_fn(ActionKind::MoveVideo, bind(&deps, fs::move_video))
        .register_fn(ActionKind::DownloadChat, bind(&deps, chat::download_chat))
        .register_fn(ActionKind::CaptureLiveChat, bind(&deps, chat::capture_live_chat))
        .register_fn(ActionKind::FinishLiveChat, bind(&deps, chat::finish_live_chat))
        .register_fn(ActionKind::ConvertLiveChat, bind(&deps, chat::convert_live_chat))
        .register_fn(ActionKind::RenderChat, bind(&deps, chat::render_chat))
        .register_fn(ActionKind::MoveChat, bind(&deps, fs::move_chat));
}
