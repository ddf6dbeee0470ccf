//! Action kinds and the handler registration table.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::database::models::TaskName;
use crate::pipeline::policy::TaskClass;
use crate::substrate::{ActionContext, ActionError, WorkerQueue};

/// Every action the graphs can schedule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    CreateFolder,
    SaveVideoInfo,
    SaveLiveVideoInfo,
    DownloadThumbnails,
    DownloadLiveThumbnail,
    DownloadVideo,
    DownloadLiveVideo,
    /// Keep the partial output of an interrupted live video capture.
    FinishLiveVideo,
    ConvertVideo,
    MoveVideo,
    DownloadChat,
    CaptureLiveChat,
    /// Keep the partial output of an interrupted live chat capture.
    FinishLiveChat,
    ConvertLiveChat,
    RenderChat,
    MoveChat,
}

impl ActionKind {
    /// Status column this action reports into.
    pub fn task(&self) -> TaskName {
        match self {
            Self::CreateFolder => TaskName::CreateFolder,
            Self::SaveVideoInfo | Self::SaveLiveVideoInfo => TaskName::SaveInfo,
            Self::DownloadThumbnails | Self::DownloadLiveThumbnail => TaskName::DownloadThumbnail,
            Self::DownloadVideo | Self::DownloadLiveVideo | Self::FinishLiveVideo => {
                TaskName::VideoDownload
            }
            Self::ConvertVideo => TaskName::VideoConvert,
            Self::MoveVideo => TaskName::VideoMove,
            Self::DownloadChat | Self::CaptureLiveChat | Self::FinishLiveChat => {
                TaskName::ChatDownload
            }
            Self::ConvertLiveChat => TaskName::ChatConvert,
            Self::RenderChat => TaskName::ChatRender,
            Self::MoveChat => TaskName::ChatMove,
        }
    }

    pub fn class(&self) -> TaskClass {
        match self {
            Self::CreateFolder
            | Self::SaveVideoInfo
            | Self::SaveLiveVideoInfo
            | Self::DownloadThumbnails
            | Self::DownloadLiveThumbnail
            | Self::FinishLiveVideo
            | Self::FinishLiveChat => TaskClass::Fast,
            Self::DownloadVideo
            | Self::ConvertVideo
            | Self::MoveVideo
            | Self::MoveChat
            | Self::DownloadChat
            | Self::ConvertLiveChat
            | Self::RenderChat => TaskClass::Long,
            Self::DownloadLiveVideo | Self::CaptureLiveChat => TaskClass::LiveCapture,
        }
    }

    pub fn queue(&self) -> WorkerQueue {
        match self {
            Self::CreateFolder
            | Self::SaveVideoInfo
            | Self::SaveLiveVideoInfo
            | Self::DownloadThumbnails
            | Self::DownloadLiveThumbnail
            | Self::MoveVideo
            | Self::MoveChat
            | Self::FinishLiveVideo
            | Self::FinishLiveChat => WorkerQueue::Archive,
            Self::DownloadVideo => WorkerQueue::VideoDownload,
            Self::ConvertVideo => WorkerQueue::VideoConvert,
            Self::DownloadChat | Self::ConvertLiveChat => WorkerQueue::ChatDownload,
            Self::RenderChat => WorkerQueue::ChatRender,
            Self::DownloadLiveVideo => WorkerQueue::Live,
            Self::CaptureLiveChat => WorkerQueue::LiveChat,
        }
    }

    /// Action that settles this task when a previous run left it RUNNING.
    ///
    /// A live capture cannot be restarted without losing what it already
    /// wrote, so an interrupted one is finished with its partial output.
    pub fn on_interrupted(&self) -> Option<ActionKind> {
        match self {
            Self::DownloadLiveVideo => Some(Self::FinishLiveVideo),
            Self::CaptureLiveChat => Some(Self::FinishLiveChat),
            _ => None,
        }
    }
}

/// An action failure tagged with the task it failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("task {task} failed after {attempts} attempt(s): {source}")]
pub struct TaskError {
    pub task: TaskName,
    pub attempts: u32,
    pub source: ActionError,
}

impl TaskError {
    pub fn new(task: TaskName, attempts: u32, source: ActionError) -> Self {
        Self {
            task,
            attempts,
            source,
        }
    }

    pub fn is_no_stream(&self) -> bool {
        matches!(self.source, ActionError::NoStream { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, ActionError::Cancelled)
    }
}

/// The job an action works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTarget {
    pub archive_id: String,
    pub vod_id: String,
}

/// Implementation of one [`ActionKind`].
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(&self, ctx: ActionContext, target: &ArchiveTarget) -> Result<(), ActionError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(ActionContext, ArchiveTarget) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ActionError>> + Send,
{
    async fn run(&self, ctx: ActionContext, target: &ArchiveTarget) -> Result<(), ActionError> {
        (self.0)(ctx, target.clone()).await
    }
}

/// Maps action kinds to their handlers.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Register a closure as the handler for `kind`.
    pub fn register_fn<F, Fut>(&mut self, kind: ActionKind, f: F) -> &mut Self
    where
        F: Fn(ActionContext, ArchiveTarget) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        self.register(kind, Arc::new(FnHandler(f)))
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: ActionKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}
