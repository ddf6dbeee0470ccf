//! Rollback of a live archive that found nothing to capture.
//!
//! Runs only for the no-stream sentinel. Every step is best-effort: a
//! failed step is logged and the remaining steps still run, so a half
//! rolled-back job never blocks the channel from being archived again.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::Result;
use crate::actions::paths::ArtifactLayout;
use crate::database::models::{ArchiveContext, ExecutionSlot};
use crate::database::repositories::{
    ArchiveRepository, ChannelRepository, SignalRepository, VodRepository, load_archive_context,
};
use crate::notification::{ArchiveEvent, NotificationService};
use crate::pipeline::live::CaptureRegistry;
use crate::substrate::Substrate;
use crate::utils::fs;

/// What a compensation run removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub terminated: bool,
    pub scratch_files_removed: usize,
    pub record_deleted: bool,
    pub processes_killed: usize,
}

pub struct CompensationHandler {
    archives: Arc<dyn ArchiveRepository>,
    vods: Arc<dyn VodRepository>,
    channels: Arc<dyn ChannelRepository>,
    signals: Arc<dyn SignalRepository>,
    substrate: Arc<dyn Substrate>,
    captures: Arc<CaptureRegistry>,
    layout: ArtifactLayout,
    /// File name of the external chat capture tool, matched against the
    /// end of process arguments.
    chat_capture_tool: String,
    notifications: NotificationService,
}

impl CompensationHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        archives: Arc<dyn ArchiveRepository>,
        vods: Arc<dyn VodRepository>,
        channels: Arc<dyn ChannelRepository>,
        signals: Arc<dyn SignalRepository>,
        substrate: Arc<dyn Substrate>,
        captures: Arc<CaptureRegistry>,
        layout: ArtifactLayout,
        chat_capture_tool: &str,
        notifications: NotificationService,
    ) -> Self {
        let chat_capture_tool = std::path::Path::new(chat_capture_tool)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(chat_capture_tool)
            .to_string();
        Self {
            archives,
            vods,
            channels,
            signals,
            substrate,
            captures,
            layout,
            chat_capture_tool,
            notifications,
        }
    }

    /// Roll back a live archive whose channel had no playable stream.
    pub async fn compensate(&self, archive_id: &str) -> Result<CompensationReport> {
        let mut report = CompensationReport::default();
        let Some(ctx) = load_archive_context(
            self.archives.as_ref(),
            self.vods.as_ref(),
            self.channels.as_ref(),
            archive_id,
        )
        .await?
        else {
            debug!(archive_id, "Archive record already gone, nothing to compensate");
            self.captures.abort(archive_id);
            self.captures.remove(archive_id);
            return Ok(report);
        };
        let login = ctx.channel.login.clone();
        info!(archive_id, channel = %login, "Compensating live archive with no stream");

        // 1. Stop the job. Children are cancelled with the root.
        if let Some(root) = ctx.record.execution_id(ExecutionSlot::Pipeline) {
            match self.substrate.terminate(root, "no playable stream").await {
                Ok(terminated) => report.terminated = terminated,
                Err(e) => warn!(archive_id, error = %e, "Failed to terminate pipeline"),
            }
        }
        self.captures.abort(archive_id);

        // 2. Working directory and scratch files.
        report.scratch_files_removed = self.remove_artifacts(&ctx).await;

        // 3. Rows.
        report.record_deleted = self.delete_rows(&ctx).await;

        // 4. Any chat capture process that outlived its action.
        let tool = self.chat_capture_tool.clone();
        let channel_url = format!("twitch.tv/{login}");
        report.processes_killed = tokio::task::spawn_blocking(move || {
            process_utils::kill_matching(&[tool.as_str(), channel_url.as_str()])
        })
        .await
        .unwrap_or_else(|e| {
            warn!(archive_id, error = %e, "Process scan panicked");
            0
        });
        if report.processes_killed > 0 {
            info!(archive_id, killed = report.processes_killed, "Killed orphaned chat capture");
        }
        self.captures.remove(archive_id);

        self.notifications
            .notify(ArchiveEvent::ArchiveCompensated {
                archive_id: archive_id.to_string(),
                channel_login: login,
                timestamp: Utc::now(),
            })
            .await;

        Ok(report)
    }

    async fn remove_artifacts(&self, ctx: &ArchiveContext) -> usize {
        let archive_id = ctx.record.id.as_str();
        let paths = self.layout.paths(ctx);
        if let Err(e) = fs::remove_dir_if_exists(&paths.folder).await {
            warn!(archive_id, error = %e, "Failed to remove archive folder");
        }
        match fs::remove_with_prefix(&paths.temp_dir, &paths.scratch_prefix).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(archive_id, error = %e, "Failed to remove scratch files");
                0
            }
        }
    }

    async fn delete_rows(&self, ctx: &ArchiveContext) -> bool {
        let archive_id = ctx.record.id.as_str();
        for slot in [
            ExecutionSlot::Pipeline,
            ExecutionSlot::ChatCapture,
            ExecutionSlot::ChatArchive,
        ] {
            if let Some(execution_id) = ctx.record.execution_id(slot)
                && let Err(e) = self.signals.delete_for_execution(execution_id).await
            {
                warn!(archive_id, %slot, error = %e, "Failed to delete signals");
            }
        }

        let deleted = match self.archives.delete(archive_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(archive_id, error = %e, "Failed to delete archive record");
                false
            }
        };
        if let Err(e) = self.vods.delete(&ctx.vod.id).await {
            warn!(archive_id, vod_id = %ctx.vod.id, error = %e, "Failed to delete vod");
        }
        if let Err(e) = self.channels.set_live(&ctx.channel.id, false).await {
            warn!(archive_id, error = %e, "Failed to clear channel live flag");
        }
        deleted
    }
}
