//! Completion detection.
//!
//! Evaluated after every successful task. The record is always re-read since
//! video-side and chat-side tasks update it independently; every write is a
//! conditional single-row update, so evaluating twice is a no-op.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::Result;
use crate::database::models::ArchiveMode;
use crate::database::repositories::ArchiveRepository;
use crate::notification::{ArchiveEvent, NotificationService};

/// What an evaluation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionState {
    /// `video_processing` was cleared by this call.
    pub video_cleared: bool,
    /// `chat_processing` was cleared by this call.
    pub chat_cleared: bool,
    /// This call claimed completion and emitted the notification.
    pub completed: bool,
}

pub struct CompletionDetector {
    archives: Arc<dyn ArchiveRepository>,
    notifications: NotificationService,
}

impl CompletionDetector {
    pub fn new(archives: Arc<dyn ArchiveRepository>, notifications: NotificationService) -> Self {
        Self {
            archives,
            notifications,
        }
    }

    /// Re-read the record and clear whatever its task statuses allow.
    ///
    /// A deleted record (compensated or user-deleted) evaluates to nothing.
    pub async fn evaluate(&self, archive_id: &str) -> Result<CompletionState> {
        let mut state = CompletionState::default();
        let Some(record) = self.archives.find(archive_id).await? else {
            debug!(archive_id, "Archive record gone, skipping completion check");
            return Ok(state);
        };
        if record.is_completed() {
            return Ok(state);
        }

        if record.video_processing && record.video_tasks_succeeded() {
            state.video_cleared = self.archives.clear_video_processing(archive_id).await?;
        }
        if record.chat_processing && record.chat_tasks_succeeded() {
            state.chat_cleared = self.archives.clear_chat_processing(archive_id).await?;
        }

        if record.all_tasks_succeeded() && self.archives.mark_completed(archive_id).await? {
            state.completed = true;
            info!(archive_id, vod_id = %record.vod_id, mode = %record.mode, "Archive completed");
            self.notifications
                .notify(ArchiveEvent::ArchiveCompleted {
                    archive_id: record.id.clone(),
                    vod_id: record.vod_id.clone(),
                    mode: record.get_mode().unwrap_or(ArchiveMode::Vod),
                    timestamp: Utc::now(),
                })
                .await;
        }

        Ok(state)
    }
}
