//! Archive job service.
//!
//! Creates archive records, builds the job's graph and runs it as a root
//! sub-execution. Also owns the job-level operations: stop, resume, task
//! reset and delete.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::actions::paths::ArtifactLayout;
use crate::database::models::{
    ArchiveMode, ArchiveOptions, ArchiveRecordDbModel, ChannelDbModel, ExecutionSlot, TaskName,
    TaskStatus, VideoType, VodDbModel,
};
use crate::database::repositories::{
    ArchiveRepository, ChannelRepository, SignalRepository, VodRepository, load_archive_context,
};
use crate::database::time::now_ms;
use crate::notification::NotificationService;
use crate::pipeline::compensation::CompensationHandler;
use crate::pipeline::completion::CompletionDetector;
use crate::pipeline::executor::TaskExecutor;
use crate::pipeline::graph::{GraphRunner, live_graph, role_execution_id, vod_graph};
use crate::pipeline::live::CaptureRegistry;
use crate::pipeline::policy::PolicyTable;
use crate::pipeline::task::{ActionRegistry, ArchiveTarget};
use crate::platform::PlatformClient;
use crate::substrate::{
    ExecutionHandle, ExecutionOutcome, SubExecution, Substrate, execution_body,
};
use crate::utils::fs;
use crate::{Error, Result};

/// What to archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoRef {
    /// A published video, by platform video id.
    Vod { external_id: String },
    /// Whatever the channel is broadcasting now.
    Live { channel_login: String },
}

/// Collaborators of [`ArchiveService`].
pub struct ServiceDeps {
    pub archives: Arc<dyn ArchiveRepository>,
    pub vods: Arc<dyn VodRepository>,
    pub channels: Arc<dyn ChannelRepository>,
    pub signals: Arc<dyn SignalRepository>,
    pub substrate: Arc<dyn Substrate>,
    pub platform: Arc<dyn PlatformClient>,
    pub captures: Arc<CaptureRegistry>,
    pub registry: ActionRegistry,
    pub policies: PolicyTable,
    pub heartbeat_interval: Duration,
    pub live_thumbnail_delay: Duration,
    pub layout: ArtifactLayout,
    /// Program of the external live chat capture tool.
    pub chat_capture_tool: String,
    pub notifications: NotificationService,
}

pub struct ArchiveService {
    archives: Arc<dyn ArchiveRepository>,
    vods: Arc<dyn VodRepository>,
    channels: Arc<dyn ChannelRepository>,
    signals: Arc<dyn SignalRepository>,
    substrate: Arc<dyn Substrate>,
    platform: Arc<dyn PlatformClient>,
    captures: Arc<CaptureRegistry>,
    executor: Arc<TaskExecutor>,
    compensation: Arc<CompensationHandler>,
    layout: ArtifactLayout,
    live_thumbnail_delay: Duration,
}

impl ArchiveService {
    pub fn new(deps: ServiceDeps) -> Self {
        let completion = Arc::new(CompletionDetector::new(
            deps.archives.clone(),
            deps.notifications.clone(),
        ));
        let executor = Arc::new(TaskExecutor::new(
            deps.archives.clone(),
            deps.substrate.clone(),
            deps.registry,
            deps.policies,
            deps.heartbeat_interval,
            completion,
            deps.notifications.clone(),
        ));
        let compensation = Arc::new(CompensationHandler::new(
            deps.archives.clone(),
            deps.vods.clone(),
            deps.channels.clone(),
            deps.signals.clone(),
            deps.substrate.clone(),
            deps.captures.clone(),
            deps.layout.clone(),
            &deps.chat_capture_tool,
            deps.notifications,
        ));

        Self {
            archives: deps.archives,
            vods: deps.vods,
            channels: deps.channels,
            signals: deps.signals,
            substrate: deps.substrate,
            platform: deps.platform,
            captures: deps.captures,
            executor,
            compensation,
            layout: deps.layout,
            live_thumbnail_delay: deps.live_thumbnail_delay,
        }
    }

    /// Create an archive job and start its graph.
    pub async fn create_archive_job(
        &self,
        video: VideoRef,
        options: ArchiveOptions,
    ) -> Result<ArchiveRecordDbModel> {
        let (vod, mode) = match &video {
            VideoRef::Vod { external_id } => (self.prepare_vod(external_id).await?, ArchiveMode::Vod),
            VideoRef::Live { channel_login } => {
                (self.prepare_live(channel_login).await?, ArchiveMode::Live)
            }
        };

        let mut record = ArchiveRecordDbModel::new(&vod.id, mode, &options);
        self.archives.create(&record).await?;
        info!(
            archive_id = %record.id,
            vod_id = %vod.id,
            external_id = %vod.external_id,
            %mode,
            archive_chat = options.archive_chat,
            render_chat = options.render_chat,
            "Archive job created"
        );

        // Creation-time snapshot; the graph may already be updating or deleting the row.
        let handle = self.start_pipeline(&record).await?;
        record.pipeline_execution_id = Some(handle.execution_id);
        Ok(record)
    }

    async fn prepare_vod(&self, external_id: &str) -> Result<VodDbModel> {
        let info = self.platform.get_video(external_id).await?;
        let channel = self
            .channels
            .upsert(&ChannelDbModel::new(
                &info.user_id,
                &info.user_login,
                &info.user_name,
            ))
            .await?;

        let mut vod = VodDbModel::new(&channel.id, &info.id, VideoType::Archive, &info.title);
        vod.external_stream_id = info.stream_id.clone();
        vod.duration_secs = info.duration_secs;
        vod.streamed_at = Some(info.created_at.timestamp_millis());
        self.vods.create(&vod).await?;
        Ok(vod)
    }

    /// A live job is created even when the channel is offline; the info
    /// task then finds no stream and the job is compensated.
    async fn prepare_live(&self, channel_login: &str) -> Result<VodDbModel> {
        let info = self
            .platform
            .get_channel(channel_login)
            .await?
            .ok_or_else(|| Error::not_found("Channel", channel_login))?;
        let channel = self
            .channels
            .upsert(&ChannelDbModel::new(&info.id, &info.login, &info.display_name))
            .await?;

        let stream = self.platform.get_live_stream(&info.login).await?;
        let vod = match stream {
            Some(stream) => {
                let mut vod =
                    VodDbModel::new(&channel.id, &stream.id, VideoType::Live, &stream.title);
                vod.external_stream_id = Some(stream.id);
                vod.streamed_at = Some(stream.started_at.timestamp_millis());
                vod
            }
            None => {
                let placeholder = format!("live-{}", now_ms() / 1000);
                VodDbModel::new(&channel.id, placeholder, VideoType::Live, "")
            }
        };
        self.vods.create(&vod).await?;
        self.channels.set_live(&channel.id, true).await?;
        Ok(vod)
    }

    /// Start (or reattach to) the root execution of a record's graph.
    async fn start_pipeline(&self, record: &ArchiveRecordDbModel) -> Result<ExecutionHandle> {
        let archive_id = record.id.clone();
        let execution_id = record
            .execution_id(ExecutionSlot::Pipeline)
            .map(str::to_string)
            .unwrap_or_else(|| role_execution_id(&archive_id, ExecutionSlot::Pipeline));
        self.archives
            .set_execution_id(&archive_id, ExecutionSlot::Pipeline, &execution_id)
            .await?;

        let options = record.options();
        let live = record.is_live();
        let graph = if live {
            live_graph(&options, self.live_thumbnail_delay)
        } else {
            vod_graph(&options)
        };
        let runner = GraphRunner::new(
            ArchiveTarget {
                archive_id: archive_id.clone(),
                vod_id: record.vod_id.clone(),
            },
            self.executor.clone(),
            self.substrate.clone(),
            self.archives.clone(),
        );
        let compensation = self.compensation.clone();
        let captures = self.captures.clone();

        let body = execution_body(move |scope| async move {
            let result = runner.run(&scope, &graph).await;
            match &result {
                Ok(()) => {
                    info!(archive_id = %archive_id, "Archive graph finished");
                }
                Err(e) if live && e.is_no_stream() => {
                    if let Err(ce) = compensation.compensate(&archive_id).await {
                        error!(archive_id = %archive_id, error = %ce, "Compensation failed");
                    }
                }
                Err(e) if e.is_cancelled() => {
                    info!(archive_id = %archive_id, "Archive graph cancelled");
                }
                Err(e) => {
                    warn!(archive_id = %archive_id, error = %e, "Archive graph failed");
                }
            }
            // Nothing captures for this job once its graph has returned.
            captures.remove(&archive_id);
            result
        });

        self.substrate
            .start_sub_execution(SubExecution {
                execution_id,
                parent: None,
                body,
            })
            .await
    }

    /// Terminate a running job. Task statuses stay as they are so the job
    /// can be resumed. Returns false if nothing was running.
    pub async fn stop_archive_job(&self, archive_id: &str) -> Result<bool> {
        let record = self.archives.get(archive_id).await?;
        let Some(root) = record.execution_id(ExecutionSlot::Pipeline) else {
            return Ok(false);
        };
        let stopped = self.substrate.terminate(root, "stopped by user").await?;
        info!(archive_id, stopped, "Stop requested");
        Ok(stopped)
    }

    pub async fn get_archive_record(&self, archive_id: &str) -> Result<ArchiveRecordDbModel> {
        self.archives.get(archive_id).await
    }

    /// Run a job's graph again. Tasks that already succeeded are skipped.
    pub async fn resume_archive_job(&self, archive_id: &str) -> Result<ExecutionHandle> {
        let record = self.archives.get(archive_id).await?;
        if record.is_completed() {
            return Err(Error::validation(format!(
                "archive {archive_id} is already completed"
            )));
        }
        info!(archive_id, "Resuming archive job");
        self.start_pipeline(&record).await
    }

    /// Resume every job still marked processing. Returns how many started.
    pub async fn resume_incomplete(&self) -> Result<usize> {
        let records = self.archives.list_processing().await?;
        let mut resumed = 0;
        for record in records {
            if record.is_completed() {
                continue;
            }
            match self.start_pipeline(&record).await {
                Ok(_) => resumed += 1,
                Err(e) => warn!(archive_id = %record.id, error = %e, "Failed to resume archive job"),
            }
        }
        if resumed > 0 {
            info!(resumed, "Resumed incomplete archive jobs");
        }
        Ok(resumed)
    }

    /// Move a FAILED task back to PENDING so a resume runs it again.
    pub async fn reset_task(&self, archive_id: &str, task: TaskName) -> Result<()> {
        let record = self.archives.get(archive_id).await?;
        if !self
            .archives
            .transition_task(archive_id, task, TaskStatus::Pending)
            .await?
        {
            return Err(Error::InvalidStateTransition {
                from: record.status(task).to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        info!(archive_id, %task, "Task reset");
        Ok(())
    }

    /// Stop a job and delete its record, VOD row and signals. Archived
    /// files are kept unless `remove_files` is set.
    pub async fn delete_archive_job(&self, archive_id: &str, remove_files: bool) -> Result<()> {
        let ctx = load_archive_context(
            self.archives.as_ref(),
            self.vods.as_ref(),
            self.channels.as_ref(),
            archive_id,
        )
        .await?
        .ok_or_else(|| Error::not_found("Archive", archive_id))?;

        if let Some(root) = ctx.record.execution_id(ExecutionSlot::Pipeline) {
            self.substrate.terminate(root, "deleted by user").await?;
        }
        self.captures.abort(archive_id);
        self.captures.remove(archive_id);

        let paths = self.layout.paths(&ctx);
        fs::remove_with_prefix(&paths.temp_dir, &paths.scratch_prefix).await?;
        if remove_files {
            fs::remove_dir_if_exists(&paths.folder).await?;
        }

        for slot in [
            ExecutionSlot::Pipeline,
            ExecutionSlot::ChatCapture,
            ExecutionSlot::ChatArchive,
        ] {
            if let Some(execution_id) = ctx.record.execution_id(slot) {
                self.signals.delete_for_execution(execution_id).await?;
            }
        }
        self.archives.delete(archive_id).await?;
        self.vods.delete(&ctx.vod.id).await?;
        if ctx.record.is_live() {
            self.channels.set_live(&ctx.channel.id, false).await?;
        }
        info!(archive_id, remove_files, "Archive job deleted");
        Ok(())
    }

    /// Wait for the job's root execution to finish.
    ///
    /// Works after the record is gone, e.g. once a job was compensated.
    pub async fn wait_for_job(&self, archive_id: &str) -> Result<ExecutionOutcome> {
        let root = match self.archives.find(archive_id).await? {
            Some(record) => record.execution_id(ExecutionSlot::Pipeline).map(str::to_string),
            None => None,
        }
        .unwrap_or_else(|| role_execution_id(archive_id, ExecutionSlot::Pipeline));
        self.substrate.wait(&ExecutionHandle::new(root)).await
    }
}
