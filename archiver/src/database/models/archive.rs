//! Archive record database models.
//!
//! An archive record tracks one archive job: the status of every task in its
//! graph plus the aggregate processing flags derived from them.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// How the source is archived.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveMode {
    /// A finished video on demand.
    Vod,
    /// A broadcast that may still be running.
    Live,
}

impl ArchiveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vod => "VOD",
            Self::Live => "LIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VOD" => Some(Self::Vod),
            "LIVE" => Some(Self::Live),
            _ => None,
        }
    }
}

/// Task status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Not started yet.
    Pending,
    /// Admitted and executing (possibly between retry attempts).
    Running,
    /// Finished successfully.
    Success,
    /// Failed after exhausting its retry policy. Terminal until reset.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Statuses a task may move to `self` from.
    pub fn allowed_predecessors(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[TaskStatus::Failed],
            // RUNNING -> RUNNING happens when an interrupted job is resumed.
            Self::Running => &[TaskStatus::Pending, TaskStatus::Running],
            Self::Success | Self::Failed => &[TaskStatus::Running],
        }
    }
}

/// Every task tracked on an archive record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    CreateFolder,
    SaveInfo,
    DownloadThumbnail,
    VideoDownload,
    VideoConvert,
    VideoMove,
    ChatDownload,
    ChatConvert,
    ChatRender,
    ChatMove,
}

impl TaskName {
    pub const VIDEO: [TaskName; 3] = [Self::VideoDownload, Self::VideoConvert, Self::VideoMove];
    pub const CHAT: [TaskName; 4] = [
        Self::ChatDownload,
        Self::ChatConvert,
        Self::ChatRender,
        Self::ChatMove,
    ];

    /// Column holding this task's status.
    pub fn column(&self) -> &'static str {
        match self {
            Self::CreateFolder => "task_create_folder",
            Self::SaveInfo => "task_save_info",
            Self::DownloadThumbnail => "task_download_thumbnail",
            Self::VideoDownload => "task_video_download",
            Self::VideoConvert => "task_video_convert",
            Self::VideoMove => "task_video_move",
            Self::ChatDownload => "task_chat_download",
            Self::ChatConvert => "task_chat_convert",
            Self::ChatRender => "task_chat_render",
            Self::ChatMove => "task_chat_move",
        }
    }

    pub fn is_video(&self) -> bool {
        Self::VIDEO.contains(self)
    }

    pub fn is_chat(&self) -> bool {
        Self::CHAT.contains(self)
    }
}

/// Sub-execution handles recorded on an archive record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ExecutionSlot {
    /// The root execution running the job's graph.
    Pipeline,
    /// Live chat capture.
    ChatCapture,
    /// Live chat convert/render/move.
    ChatArchive,
}

impl ExecutionSlot {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Pipeline => "pipeline_execution_id",
            Self::ChatCapture => "chat_capture_execution_id",
            Self::ChatArchive => "chat_archive_execution_id",
        }
    }
}

/// Options chosen when an archive job is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveOptions {
    /// Archive the chat alongside the video.
    pub archive_chat: bool,
    /// Render the archived chat to a video.
    pub render_chat: bool,
    /// Convert the video to HLS instead of a single MP4.
    #[serde(default)]
    pub save_as_hls: bool,
    /// Requested download quality.
    #[serde(default = "default_quality")]
    pub quality: String,
}

fn default_quality() -> String {
    "best".to_string()
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            archive_chat: true,
            render_chat: true,
            save_as_hls: false,
            quality: default_quality(),
        }
    }
}

/// Archive record database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ArchiveRecordDbModel {
    pub id: String,
    pub vod_id: String,
    /// Mode: VOD, LIVE
    pub mode: String,
    pub archive_chat: bool,
    pub render_chat: bool,
    pub save_as_hls: bool,
    pub quality: String,
    pub video_processing: bool,
    pub chat_processing: bool,
    /// Always `video_processing || chat_processing`.
    pub processing: bool,
    pub task_create_folder: String,
    pub task_save_info: String,
    pub task_download_thumbnail: String,
    pub task_video_download: String,
    pub task_video_convert: String,
    pub task_video_move: String,
    pub task_chat_download: String,
    pub task_chat_convert: String,
    pub task_chat_render: String,
    pub task_chat_move: String,
    /// Root sub-execution running this job's graph.
    pub pipeline_execution_id: Option<String>,
    /// Live chat-capture sub-execution (signal target only).
    pub chat_capture_execution_id: Option<String>,
    /// Live chat-archive sub-execution (signal target only).
    pub chat_archive_execution_id: Option<String>,
    /// Unix epoch milliseconds when live chat capture began.
    pub chat_start_timestamp: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ArchiveRecordDbModel {
    /// Create a new record with tasks that will never run pre-set to SUCCESS.
    pub fn new(vod_id: impl Into<String>, mode: ArchiveMode, options: &ArchiveOptions) -> Self {
        let now = crate::database::time::now_ms();
        let pending = TaskStatus::Pending.as_str().to_string();
        let success = TaskStatus::Success.as_str().to_string();
        let chat_status = |enabled: bool| {
            if enabled && options.archive_chat {
                pending.clone()
            } else {
                success.clone()
            }
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            vod_id: vod_id.into(),
            mode: mode.as_str().to_string(),
            archive_chat: options.archive_chat,
            render_chat: options.render_chat,
            save_as_hls: options.save_as_hls,
            quality: options.quality.clone(),
            video_processing: true,
            chat_processing: options.archive_chat,
            processing: true,
            task_create_folder: pending.clone(),
            task_save_info: pending.clone(),
            task_download_thumbnail: pending.clone(),
            task_video_download: pending.clone(),
            task_video_convert: pending.clone(),
            task_video_move: pending.clone(),
            task_chat_download: chat_status(true),
            // Only live chat needs converting to the downloader's format.
            task_chat_convert: chat_status(mode == ArchiveMode::Live),
            task_chat_render: chat_status(options.render_chat),
            task_chat_move: chat_status(true),
            pipeline_execution_id: None,
            chat_capture_execution_id: None,
            chat_archive_execution_id: None,
            chat_start_timestamp: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn get_mode(&self) -> Option<ArchiveMode> {
        ArchiveMode::parse(&self.mode)
    }

    pub fn is_live(&self) -> bool {
        self.get_mode() == Some(ArchiveMode::Live)
    }

    pub fn options(&self) -> ArchiveOptions {
        ArchiveOptions {
            archive_chat: self.archive_chat,
            render_chat: self.render_chat,
            save_as_hls: self.save_as_hls,
            quality: self.quality.clone(),
        }
    }

    /// Recorded execution id for a slot.
    pub fn execution_id(&self, slot: ExecutionSlot) -> Option<&str> {
        match slot {
            ExecutionSlot::Pipeline => self.pipeline_execution_id.as_deref(),
            ExecutionSlot::ChatCapture => self.chat_capture_execution_id.as_deref(),
            ExecutionSlot::ChatArchive => self.chat_archive_execution_id.as_deref(),
        }
    }

    fn raw_status(&self, task: TaskName) -> &str {
        match task {
            TaskName::CreateFolder => &self.task_create_folder,
            TaskName::SaveInfo => &self.task_save_info,
            TaskName::DownloadThumbnail => &self.task_download_thumbnail,
            TaskName::VideoDownload => &self.task_video_download,
            TaskName::VideoConvert => &self.task_video_convert,
            TaskName::VideoMove => &self.task_video_move,
            TaskName::ChatDownload => &self.task_chat_download,
            TaskName::ChatConvert => &self.task_chat_convert,
            TaskName::ChatRender => &self.task_chat_render,
            TaskName::ChatMove => &self.task_chat_move,
        }
    }

    /// Status of a single task. Unknown values read as PENDING.
    pub fn status(&self, task: TaskName) -> TaskStatus {
        TaskStatus::parse(self.raw_status(task)).unwrap_or(TaskStatus::Pending)
    }

    fn all_success(&self, tasks: &[TaskName]) -> bool {
        tasks
            .iter()
            .all(|task| self.status(*task) == TaskStatus::Success)
    }

    /// Video download, convert and move have all succeeded.
    pub fn video_tasks_succeeded(&self) -> bool {
        self.all_success(&TaskName::VIDEO)
    }

    /// Every chat task succeeded. Disabled ones were pre-set at creation.
    pub fn chat_tasks_succeeded(&self) -> bool {
        self.all_success(&TaskName::CHAT)
    }

    /// Tasks whose success is required before the job counts as complete.
    ///
    /// The live thumbnail is fire-and-forget and does not gate completion.
    pub fn completion_tasks(&self) -> Vec<TaskName> {
        use strum::IntoEnumIterator;
        let live = self.is_live();
        TaskName::iter()
            .filter(|task| !(live && *task == TaskName::DownloadThumbnail))
            .collect()
    }

    /// All tasks relevant to this record's mode have succeeded.
    pub fn all_tasks_succeeded(&self) -> bool {
        self.all_success(&self.completion_tasks())
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}
