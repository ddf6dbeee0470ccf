//! Notification events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::models::{ArchiveMode, TaskName};

/// Priority level for notifications.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Events emitted by the archive pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArchiveEvent {
    /// Every relevant task succeeded. Emitted once per archive.
    ArchiveCompleted {
        archive_id: String,
        vod_id: String,
        mode: ArchiveMode,
        timestamp: DateTime<Utc>,
    },
    /// A task exhausted its retry policy or failed permanently.
    TaskFailed {
        archive_id: String,
        vod_id: String,
        task: TaskName,
        attempts: u32,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
    /// A live archive found no stream and was rolled back.
    ArchiveCompensated {
        archive_id: String,
        channel_login: String,
        timestamp: DateTime<Utc>,
    },
}

impl ArchiveEvent {
    pub fn priority(&self) -> NotificationPriority {
        match self {
            Self::ArchiveCompleted { .. } => NotificationPriority::Normal,
            Self::TaskFailed { .. } => NotificationPriority::High,
            Self::ArchiveCompensated { .. } => NotificationPriority::Low,
        }
    }

    /// Stable snake_case event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ArchiveCompleted { .. } => "archive_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::ArchiveCompensated { .. } => "archive_compensated",
        }
    }

    pub fn archive_id(&self) -> &str {
        match self {
            Self::ArchiveCompleted { archive_id, .. }
            | Self::TaskFailed { archive_id, .. }
            | Self::ArchiveCompensated { archive_id, .. } => archive_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ArchiveCompleted { timestamp, .. }
            | Self::TaskFailed { timestamp, .. }
            | Self::ArchiveCompensated { timestamp, .. } => *timestamp,
        }
    }

    pub fn title(&self) -> String {
        match self {
            Self::ArchiveCompleted { mode, .. } => format!("{mode} archive completed"),
            Self::TaskFailed { task, .. } => format!("Archive task {task} failed"),
            Self::ArchiveCompensated { channel_login, .. } => {
                format!("Live archive of {channel_login} cancelled")
            }
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::ArchiveCompleted { archive_id, vod_id, .. } => {
                format!("Archive {archive_id} of video {vod_id} finished")
            }
            Self::TaskFailed {
                archive_id,
                attempts,
                error_message,
                ..
            } => format!("Archive {archive_id} failed after {attempts} attempt(s): {error_message}"),
            Self::ArchiveCompensated { archive_id, .. } => {
                format!("No playable stream; archive {archive_id} and its files were removed")
            }
        }
    }
}
