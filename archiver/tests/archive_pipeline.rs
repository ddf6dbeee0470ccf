//! End-to-end runs of the archive graphs against SQLite, with fake tool
//! actions standing in for the external downloaders.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use strum::IntoEnumIterator;
use tempfile::TempDir;
use tokio::sync::Notify;

use vod_archiver::actions::paths::ArtifactLayout;
use vod_archiver::actions::{ActionDeps, register_default_actions};
use vod_archiver::config::{ConcurrencyConfig, ToolsConfig};
use vod_archiver::database;
use vod_archiver::database::models::{
    ArchiveMode, ArchiveOptions, ArchiveRecordDbModel, ChannelDbModel, TaskName, TaskStatus,
    VideoType, VodDbModel,
};
use vod_archiver::database::repositories::{
    ArchiveRepository, ChannelRepository, SqlxArchiveRepository, SqlxChannelRepository,
    SqlxSignalRepository, SqlxVodRepository, VodRepository, load_archive_context,
};
use vod_archiver::notification::{ArchiveEvent, NotificationChannel, NotificationService};
use vod_archiver::pipeline::{
    ActionHandler, ActionKind, ActionRegistry, ArchiveService, CaptureRegistry, CaptureState,
    CompletionDetector, LiveCoordinator, PolicyTable, RetryPolicy, ServiceDeps, VideoRef,
};
use vod_archiver::platform::{
    Chapter, ChannelInfo, MutedSegment, PlatformClient, StreamInfo, VideoInfo,
};
use vod_archiver::substrate::{
    ActionError, ExecutionOutcome, JournalEvent, LocalSubstrate, SignalChannel, Substrate,
};
use vod_archiver::utils::http_client::build_client;
use vod_archiver::{Error, Result};

const LOGIN: &str = "speedrunner";
const USER_ID: &str = "u-42";
const VIDEO_ID: &str = "v100";
const STREAM_ID: &str = "s900";

struct FakePlatform {
    live: bool,
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn get_video(&self, video_id: &str) -> Result<VideoInfo> {
        Ok(VideoInfo {
            id: video_id.to_string(),
            user_id: USER_ID.to_string(),
            user_login: LOGIN.to_string(),
            user_name: "Speedrunner".to_string(),
            title: "Any% attempts".to_string(),
            created_at: Utc::now(),
            duration_secs: 3600,
            thumbnail_url: "https://cdn.example/thumb-%{width}x%{height}.jpg".to_string(),
            stream_id: Some(STREAM_ID.to_string()),
        })
    }

    async fn get_chapters(&self, _video_id: &str) -> Result<Vec<Chapter>> {
        Ok(vec![Chapter {
            description: "Just Chatting".to_string(),
            position_secs: 0,
            duration_secs: 3600,
        }])
    }

    async fn get_muted_segments(&self, _video_id: &str) -> Result<Vec<MutedSegment>> {
        Ok(Vec::new())
    }

    async fn get_channel(&self, login: &str) -> Result<Option<ChannelInfo>> {
        Ok(Some(ChannelInfo {
            id: USER_ID.to_string(),
            login: login.to_string(),
            display_name: "Speedrunner".to_string(),
        }))
    }

    async fn get_live_stream(&self, login: &str) -> Result<Option<StreamInfo>> {
        Ok(self.live.then(|| StreamInfo {
            id: STREAM_ID.to_string(),
            user_id: USER_ID.to_string(),
            user_login: login.to_string(),
            user_name: "Speedrunner".to_string(),
            title: "Live now".to_string(),
            started_at: Utc::now(),
            thumbnail_url: "https://cdn.example/live-{width}x{height}.jpg".to_string(),
        }))
    }

    async fn find_vod_for_stream(&self, _user_id: &str, _stream_id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Default)]
struct RecordingChannel {
    events: Mutex<Vec<ArchiveEvent>>,
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn channel_type(&self) -> &'static str {
        "recording"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &ArchiveEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

impl RecordingChannel {
    fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

fn quick_policy(maximum_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_millis(1),
        backoff_coefficient: 2.0,
        maximum_interval: Duration::from_millis(5),
        maximum_attempts,
        start_to_close_timeout: Duration::from_secs(10),
        heartbeat_timeout: None,
    }
}

struct Harness {
    dir: TempDir,
    layout: ArtifactLayout,
    service: ArchiveService,
    archives: Arc<SqlxArchiveRepository>,
    vods: Arc<SqlxVodRepository>,
    channels: Arc<SqlxChannelRepository>,
    substrate: Arc<LocalSubstrate>,
    notifications: NotificationService,
    recorder: Arc<RecordingChannel>,
    calls: Arc<Mutex<Vec<ActionKind>>>,
}

impl Harness {
    fn videos_dir(&self) -> PathBuf {
        self.dir.path().join("videos")
    }

    fn calls(&self) -> Vec<ActionKind> {
        self.calls.lock().clone()
    }

    fn position(&self, kind: ActionKind) -> usize {
        self.calls()
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_else(|| panic!("{kind} never ran"))
    }

    fn times(&self, kind: ActionKind) -> usize {
        self.calls().iter().filter(|k| **k == kind).count()
    }

    async fn record(&self, archive_id: &str) -> ArchiveRecordDbModel {
        self.archives.get(archive_id).await.unwrap()
    }

    /// Scratch file a live capture records the video into.
    async fn scratch_video_source(&self, archive_id: &str) -> PathBuf {
        let ctx = load_archive_context(
            self.archives.as_ref(),
            self.vods.as_ref(),
            self.channels.as_ref(),
            archive_id,
        )
        .await
        .unwrap()
        .expect("archive context");
        self.layout.paths(&ctx).scratch_video_source()
    }

    async fn channel(&self) -> ChannelDbModel {
        self.channels
            .find_by_external_id(USER_ID)
            .await
            .unwrap()
            .expect("channel row")
    }
}

/// Build a service whose tool-bound actions are fakes. Folder creation and
/// info saving run for real against the fake platform. `configure` may
/// replace any handler before every handler is wrapped to record its calls.
async fn harness(
    live: bool,
    configure: impl FnOnce(&mut ActionRegistry, &Arc<CaptureRegistry>),
) -> Harness {
    harness_with(live, ConcurrencyConfig::default(), configure).await
}

async fn harness_with(
    live: bool,
    concurrency: ConcurrencyConfig,
    configure: impl FnOnce(&mut ActionRegistry, &Arc<CaptureRegistry>),
) -> Harness {
    let dir = TempDir::new().unwrap();
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        dir.path()
            .join("archiver.db")
            .to_string_lossy()
            .replace('\\', "/")
    );
    let pool = database::init_pool(&db_url).await.unwrap();
    database::run_migrations(&pool).await.unwrap();

    let archives = Arc::new(SqlxArchiveRepository::new(pool.clone()));
    let vods = Arc::new(SqlxVodRepository::new(pool.clone()));
    let channels = Arc::new(SqlxChannelRepository::new(pool.clone()));
    let signals = Arc::new(SqlxSignalRepository::new(pool.clone()));
    let substrate = Arc::new(LocalSubstrate::new(
        signals.clone(),
        &concurrency,
    ));
    let platform: Arc<dyn PlatformClient> = Arc::new(FakePlatform { live });
    let captures = Arc::new(CaptureRegistry::new());
    let coordinator = Arc::new(LiveCoordinator::new(
        captures.clone(),
        channels.clone(),
        vods.clone(),
        platform.clone(),
    ));
    let layout = ArtifactLayout::new(dir.path().join("videos"), dir.path().join("tmp"));

    let mut registry = ActionRegistry::new();
    register_default_actions(
        &mut registry,
        Arc::new(ActionDeps {
            archives: archives.clone(),
            vods: vods.clone(),
            channels: channels.clone(),
            platform: platform.clone(),
            coordinator,
            layout: layout.clone(),
            tools: ToolsConfig::default(),
            http: build_client(Duration::from_secs(5)).unwrap(),
        }),
    );
    for kind in [
        ActionKind::DownloadThumbnails,
        ActionKind::DownloadLiveThumbnail,
        ActionKind::DownloadVideo,
        ActionKind::ConvertVideo,
        ActionKind::MoveVideo,
        ActionKind::DownloadChat,
        ActionKind::ConvertLiveChat,
        ActionKind::RenderChat,
        ActionKind::MoveChat,
    ] {
        registry.register_fn(kind, |_ctx, _target| async { Ok::<(), ActionError>(()) });
    }
    let stop = captures.clone();
    registry.register_fn(ActionKind::DownloadLiveVideo, move |_ctx, target| {
        let captures = stop.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            captures.finish(&target.archive_id);
            Ok::<(), ActionError>(())
        }
    });
    let watch = captures.clone();
    registry.register_fn(ActionKind::CaptureLiveChat, move |_ctx, target| {
        let rx = watch.subscribe(&target.archive_id);
        async move {
            match CaptureRegistry::stopped(rx).await {
                CaptureState::Aborted => Err(ActionError::Cancelled),
                _ => Ok(()),
            }
        }
    });
    configure(&mut registry, &captures);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut recorded = ActionRegistry::new();
    for kind in ActionKind::iter() {
        let inner = registry.get(kind).expect("every kind registered");
        let calls = calls.clone();
        recorded.register_fn(kind, move |ctx, target| {
            calls.lock().push(kind);
            let inner = inner.clone();
            async move { inner.run(ctx, &target).await }
        });
    }

    let recorder = Arc::new(RecordingChannel::default());
    let mut notifications = NotificationService::new();
    notifications.add_channel(recorder.clone());

    let service = ArchiveService::new(ServiceDeps {
        archives: archives.clone(),
        vods: vods.clone(),
        channels: channels.clone(),
        signals,
        substrate: substrate.clone(),
        platform,
        captures,
        registry: recorded,
        policies: PolicyTable {
            fast: quick_policy(2),
            long: quick_policy(3),
            live_capture: quick_policy(1),
        },
        heartbeat_interval: Duration::from_millis(10),
        live_thumbnail_delay: Duration::from_secs(3600),
        layout: layout.clone(),
        chat_capture_tool: "vod-archiver-test-chat-capture".to_string(),
        notifications: notifications.clone(),
    });

    Harness {
        dir,
        layout,
        service,
        archives,
        vods,
        channels,
        substrate,
        notifications,
        recorder,
        calls,
    }
}

fn vod(id: &str) -> VideoRef {
    VideoRef::Vod {
        external_id: id.to_string(),
    }
}

fn live() -> VideoRef {
    VideoRef::Live {
        channel_login: LOGIN.to_string(),
    }
}

#[tokio::test]
async fn vod_archive_runs_every_task_and_completes_once() {
    let h = harness(false, |_, _| {}).await;

    let record = h
        .service
        .create_archive_job(vod(VIDEO_ID), ArchiveOptions::default())
        .await
        .unwrap();
    assert_eq!(record.get_mode(), Some(ArchiveMode::Vod));

    let outcome = h.service.wait_for_job(&record.id).await.unwrap();
    assert!(outcome.is_completed(), "{outcome:?}");

    assert_eq!(h.position(ActionKind::CreateFolder), 0);
    let metadata_done = h
        .position(ActionKind::SaveVideoInfo)
        .max(h.position(ActionKind::DownloadThumbnails));
    assert!(metadata_done < h.position(ActionKind::DownloadVideo));
    assert!(metadata_done < h.position(ActionKind::DownloadChat));
    assert!(h.position(ActionKind::DownloadVideo) < h.position(ActionKind::ConvertVideo));
    assert!(h.position(ActionKind::ConvertVideo) < h.position(ActionKind::MoveVideo));
    assert!(h.position(ActionKind::DownloadChat) < h.position(ActionKind::RenderChat));
    assert!(h.position(ActionKind::RenderChat) < h.position(ActionKind::MoveChat));
    assert_eq!(h.times(ActionKind::DownloadLiveVideo), 0);
    assert_eq!(h.times(ActionKind::ConvertLiveChat), 0);

    let record = h.record(&record.id).await;
    assert!(record.is_completed());
    assert!(!record.video_processing);
    assert!(!record.chat_processing);
    assert!(!record.processing);
    for task in TaskName::iter() {
        assert_eq!(record.status(task), TaskStatus::Success, "{task}");
    }

    let vod_row = h.vods.get(&record.vod_id).await.unwrap();
    assert_eq!(vod_row.title, "Any% attempts");
    assert_eq!(vod_row.external_stream_id.as_deref(), Some(STREAM_ID));
    let info = h
        .videos_dir()
        .join(LOGIN)
        .join(&vod_row.folder_name)
        .join(format!("{}-info.json", vod_row.file_name));
    assert!(info.exists(), "{} missing", info.display());

    assert_eq!(h.recorder.count("archive_completed"), 1);
    assert_eq!(h.recorder.count("task_failed"), 0);
}

#[tokio::test]
async fn chat_disabled_archive_never_runs_chat_tasks() {
    let h = harness(false, |_, _| {}).await;
    let options = ArchiveOptions {
        archive_chat: false,
        ..Default::default()
    };

    let record = h.service.create_archive_job(vod(VIDEO_ID), options).await.unwrap();
    assert!(!record.chat_processing);
    assert_eq!(record.processing, record.video_processing || record.chat_processing);

    let outcome = h.service.wait_for_job(&record.id).await.unwrap();
    assert!(outcome.is_completed(), "{outcome:?}");
    for kind in [
        ActionKind::DownloadChat,
        ActionKind::RenderChat,
        ActionKind::MoveChat,
    ] {
        assert_eq!(h.times(kind), 0, "{kind} ran");
    }

    let record = h.record(&record.id).await;
    assert!(record.is_completed());
    assert!(!record.processing);
    assert_eq!(h.recorder.count("archive_completed"), 1);
}

#[tokio::test]
async fn exhausted_task_fails_once_and_resumes_after_reset() {
    let attempts = Arc::new(AtomicU32::new(0));
    let healthy = Arc::new(AtomicBool::new(false));
    let (count, ok) = (attempts.clone(), healthy.clone());
    let h = harness(false, move |registry, _| {
        registry.register_fn(ActionKind::DownloadVideo, move |_ctx, _target| {
            count.fetch_add(1, Ordering::SeqCst);
            let ok = ok.load(Ordering::SeqCst);
            async move {
                if ok {
                    Ok(())
                } else {
                    Err(ActionError::transient("connection reset"))
                }
            }
        });
    })
    .await;

    let record = h
        .service
        .create_archive_job(vod(VIDEO_ID), ArchiveOptions::default())
        .await
        .unwrap();
    let outcome = h.service.wait_for_job(&record.id).await.unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Failed(_)), "{outcome:?}");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let failed = h.record(&record.id).await;
    assert_eq!(failed.status(TaskName::VideoDownload), TaskStatus::Failed);
    assert_eq!(failed.status(TaskName::VideoConvert), TaskStatus::Pending);
    // The chat side is independent of the failed video side.
    assert!(failed.chat_tasks_succeeded());
    assert!(!failed.chat_processing);
    assert!(failed.video_processing);
    assert!(failed.processing);
    assert!(!failed.is_completed());

    let task_failures: Vec<_> = h
        .recorder
        .events
        .lock()
        .iter()
        .filter_map(|e| match e {
            ArchiveEvent::TaskFailed { task, attempts, .. } => Some((*task, *attempts)),
            _ => None,
        })
        .collect();
    assert_eq!(task_failures, vec![(TaskName::VideoDownload, 3)]);
    assert_eq!(h.recorder.count("archive_completed"), 0);

    let err = h
        .service
        .reset_task(&record.id, TaskName::VideoConvert)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }), "{err}");

    h.service
        .reset_task(&record.id, TaskName::VideoDownload)
        .await
        .unwrap();
    healthy.store(true, Ordering::SeqCst);
    let handle = h.service.resume_archive_job(&record.id).await.unwrap();
    let outcome = h.substrate.wait(&handle).await.unwrap();
    assert!(outcome.is_completed(), "{outcome:?}");

    let record = h.record(&record.id).await;
    assert!(record.is_completed());
    assert!(!record.processing);
    assert_eq!(h.times(ActionKind::CreateFolder), 1);
    assert_eq!(h.times(ActionKind::DownloadChat), 1);
    assert_eq!(h.recorder.count("archive_completed"), 1);
    assert_eq!(h.recorder.count("task_failed"), 1);

    let err = h.service.resume_archive_job(&record.id).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");
}

#[tokio::test]
async fn stopped_job_keeps_running_task_and_resumes() {
    let started = Arc::new(Notify::new());
    let blocking = Arc::new(AtomicBool::new(true));
    let (signal, block) = (started.clone(), blocking.clone());
    let h = harness(false, move |registry, _| {
        registry.register_fn(ActionKind::DownloadVideo, move |ctx, _target| {
            signal.notify_one();
            let block = block.load(Ordering::SeqCst);
            async move {
                if block {
                    ctx.cancel.cancelled().await;
                    return Err(ActionError::Cancelled);
                }
                Ok(())
            }
        });
    })
    .await;
    let options = ArchiveOptions {
        archive_chat: false,
        ..Default::default()
    };

    let record = h.service.create_archive_job(vod(VIDEO_ID), options).await.unwrap();
    started.notified().await;
    assert!(h.service.stop_archive_job(&record.id).await.unwrap());

    let outcome = h.service.wait_for_job(&record.id).await.unwrap();
    assert!(
        matches!(outcome, ExecutionOutcome::Terminated { ref reason } if reason == "stopped by user"),
        "{outcome:?}"
    );
    let stopped = h.record(&record.id).await;
    assert_eq!(stopped.status(TaskName::VideoDownload), TaskStatus::Running);
    assert_eq!(h.recorder.count("task_failed"), 0);

    blocking.store(false, Ordering::SeqCst);
    let handle = h.service.resume_archive_job(&record.id).await.unwrap();
    assert!(h.substrate.wait(&handle).await.unwrap().is_completed());
    assert!(h.record(&record.id).await.is_completed());
}

#[tokio::test]
async fn live_archive_starts_capture_after_video_is_admitted() {
    let h = harness(true, |_, _| {}).await;
    let options = ArchiveOptions {
        render_chat: false,
        ..Default::default()
    };

    let record = h.service.create_archive_job(live(), options).await.unwrap();
    assert_eq!(record.get_mode(), Some(ArchiveMode::Live));
    let vod_row = h.vods.get(&record.vod_id).await.unwrap();
    assert_eq!(vod_row.external_id, STREAM_ID);
    assert_eq!(vod_row.video_type, VideoType::Live.as_str());
    assert!(h.channel().await.is_live);

    let outcome = h.service.wait_for_job(&record.id).await.unwrap();
    assert!(outcome.is_completed(), "{outcome:?}");

    assert!(h.position(ActionKind::SaveLiveVideoInfo) < h.position(ActionKind::DownloadLiveVideo));
    assert!(h.position(ActionKind::DownloadLiveVideo) < h.position(ActionKind::CaptureLiveChat));
    assert!(h.position(ActionKind::CaptureLiveChat) < h.position(ActionKind::ConvertLiveChat));
    assert!(h.position(ActionKind::ConvertLiveChat) < h.position(ActionKind::MoveChat));
    assert!(h.position(ActionKind::DownloadLiveVideo) < h.position(ActionKind::ConvertVideo));
    assert_eq!(h.times(ActionKind::RenderChat), 0);
    assert_eq!(h.times(ActionKind::DownloadVideo), 0);

    let sent: Vec<(String, SignalChannel)> = h
        .substrate
        .journal()
        .into_iter()
        .filter_map(|entry| match entry.event {
            JournalEvent::SignalSent { channel } => Some((entry.execution_id, channel)),
            _ => None,
        })
        .collect();
    assert_eq!(
        sent,
        vec![
            (format!("{}-chat-capture", record.id), SignalChannel::StartCapture),
            (format!("{}-chat-archive", record.id), SignalChannel::ContinueArchive),
        ]
    );

    let record = h.record(&record.id).await;
    assert!(record.is_completed());
    assert!(!record.processing);
    assert_eq!(
        record.chat_capture_execution_id.as_deref(),
        Some(format!("{}-chat-capture", record.id).as_str())
    );
    assert_eq!(h.recorder.count("archive_completed"), 1);
}

async fn assert_compensated(h: &Harness, archive_id: &str, vod_id: &str) {
    let outcome = h.service.wait_for_job(archive_id).await.unwrap();
    assert!(
        matches!(outcome, ExecutionOutcome::Terminated { .. }),
        "{outcome:?}"
    );

    let err = h.service.get_archive_record(archive_id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "{err}");
    assert!(h.vods.find(vod_id).await.unwrap().is_none());
    assert!(!h.channel().await.is_live);

    let channel_dir = h.videos_dir().join(LOGIN);
    let leftovers = std::fs::read_dir(&channel_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "artifacts left in {}", channel_dir.display());

    assert_eq!(h.recorder.count("archive_compensated"), 1);
    assert_eq!(h.recorder.count("archive_completed"), 0);
    assert_eq!(h.recorder.count("task_failed"), 0);
}

#[tokio::test]
async fn offline_channel_is_compensated_at_info_step() {
    let h = harness(false, |_, _| {}).await;

    let record = h
        .service
        .create_archive_job(live(), ArchiveOptions::default())
        .await
        .unwrap();

    assert_compensated(&h, &record.id, &record.vod_id).await;
    assert_eq!(h.times(ActionKind::DownloadLiveVideo), 0);
    assert_eq!(h.times(ActionKind::CaptureLiveChat), 0);
}

#[tokio::test]
async fn stream_without_playable_video_is_compensated() {
    let h = harness(true, |registry, captures| {
        let captures = captures.clone();
        registry.register_fn(ActionKind::DownloadLiveVideo, move |_ctx, target| {
            captures.abort(&target.archive_id);
            async { Err::<(), _>(ActionError::no_stream(LOGIN)) }
        });
    })
    .await;

    let record = h
        .service
        .create_archive_job(live(), ArchiveOptions::default())
        .await
        .unwrap();

    assert_compensated(&h, &record.id, &record.vod_id).await;
    assert_eq!(h.times(ActionKind::ConvertVideo), 0);
    assert_eq!(h.times(ActionKind::ConvertLiveChat), 0);
}

#[tokio::test]
async fn resume_incomplete_picks_up_processing_records() {
    let h = harness(false, |_, _| {}).await;
    let channel = h
        .channels
        .upsert(&ChannelDbModel::new(USER_ID, LOGIN, "Speedrunner"))
        .await
        .unwrap();
    let vod_row = VodDbModel::new(&channel.id, VIDEO_ID, VideoType::Archive, "queued");
    h.vods.create(&vod_row).await.unwrap();
    let options = ArchiveOptions {
        archive_chat: false,
        ..Default::default()
    };
    let record = ArchiveRecordDbModel::new(&vod_row.id, ArchiveMode::Vod, &options);
    h.archives.create(&record).await.unwrap();

    assert_eq!(h.service.resume_incomplete().await.unwrap(), 1);
    let outcome = h.service.wait_for_job(&record.id).await.unwrap();
    assert!(outcome.is_completed(), "{outcome:?}");
    assert!(h.record(&record.id).await.is_completed());

    assert_eq!(h.service.resume_incomplete().await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_completion_checks_notify_once() {
    let h = harness(false, |_, _| {}).await;
    let channel = h
        .channels
        .upsert(&ChannelDbModel::new(USER_ID, LOGIN, "Speedrunner"))
        .await
        .unwrap();
    let vod_row = VodDbModel::new(&channel.id, VIDEO_ID, VideoType::Archive, "done");
    h.vods.create(&vod_row).await.unwrap();

    let mut record = ArchiveRecordDbModel::new(&vod_row.id, ArchiveMode::Vod, &ArchiveOptions::default());
    let success = TaskStatus::Success.as_str().to_string();
    record.task_create_folder = success.clone();
    record.task_save_info = success.clone();
    record.task_download_thumbnail = success.clone();
    record.task_video_download = success.clone();
    record.task_video_convert = success.clone();
    record.task_video_move = success.clone();
    record.task_chat_download = success.clone();
    record.task_chat_convert = success.clone();
    record.task_chat_render = success.clone();
    record.task_chat_move = success;
    h.archives.create(&record).await.unwrap();

    let archives: Arc<dyn ArchiveRepository> = h.archives.clone();
    let first = CompletionDetector::new(archives.clone(), h.notifications.clone());
    let second = CompletionDetector::new(archives, h.notifications.clone());
    let (a, b) = tokio::join!(first.evaluate(&record.id), second.evaluate(&record.id));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.completed ^ b.completed);
    assert!(a.video_cleared || b.video_cleared);
    let again = first.evaluate(&record.id).await.unwrap();
    assert!(!again.completed);

    let record = h.record(&record.id).await;
    assert!(record.is_completed());
    assert!(!record.processing);
    assert_eq!(h.recorder.count("archive_completed"), 1);
}

#[tokio::test]
async fn deleted_job_keeps_files_unless_asked() {
    let h = harness(false, |_, _| {}).await;
    let record = h
        .service
        .create_archive_job(vod(VIDEO_ID), ArchiveOptions::default())
        .await
        .unwrap();
    assert!(h.service.wait_for_job(&record.id).await.unwrap().is_completed());

    let vod_row = h.vods.get(&record.vod_id).await.unwrap();
    let folder = h.videos_dir().join(LOGIN).join(&vod_row.folder_name);
    assert!(folder.exists());

    h.service.delete_archive_job(&record.id, false).await.unwrap();
    assert!(folder.exists());
    assert!(h.archives.find(&record.id).await.unwrap().is_none());
    assert!(h.vods.find(&record.vod_id).await.unwrap().is_none());

    let err = h.service.delete_archive_job(&record.id, true).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "{err}");
}

#[tokio::test]
async fn interrupted_live_capture_is_kept_on_resume() {
    let started = Arc::new(Notify::new());
    let invocations = Arc::new(AtomicU32::new(0));
    let (signal, count) = (started.clone(), invocations.clone());
    let h = harness(true, move |registry, _| {
        registry.register_fn(ActionKind::DownloadLiveVideo, move |ctx, _target| {
            let first = count.fetch_add(1, Ordering::SeqCst) == 0;
            signal.notify_one();
            async move {
                if first {
                    ctx.cancel.cancelled().await;
                    return Err::<(), _>(ActionError::Cancelled);
                }
                // By now the channel has gone offline.
                Err::<(), _>(ActionError::no_stream(LOGIN))
            }
        });
    })
    .await;
    let options = ArchiveOptions {
        archive_chat: false,
        ..Default::default()
    };

    let record = h.service.create_archive_job(live(), options).await.unwrap();
    started.notified().await;
    let partial = h.scratch_video_source(&record.id).await;
    std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
    std::fs::write(&partial, b"first half of the broadcast").unwrap();

    assert!(h.service.stop_archive_job(&record.id).await.unwrap());
    let outcome = h.service.wait_for_job(&record.id).await.unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Terminated { .. }), "{outcome:?}");
    assert_eq!(
        h.record(&record.id).await.status(TaskName::VideoDownload),
        TaskStatus::Running
    );

    let handle = h.service.resume_archive_job(&record.id).await.unwrap();
    let outcome = h.substrate.wait(&handle).await.unwrap();
    assert!(outcome.is_completed(), "{outcome:?}");

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(h.times(ActionKind::FinishLiveVideo), 1);
    assert!(h.position(ActionKind::FinishLiveVideo) < h.position(ActionKind::ConvertVideo));
    assert!(partial.exists());

    let record = h.record(&record.id).await;
    assert!(record.is_completed());
    assert_eq!(record.status(TaskName::VideoDownload), TaskStatus::Success);
    assert!(h.vods.find(&record.vod_id).await.unwrap().is_some());
    assert!(!h.channel().await.is_live);
    assert_eq!(h.recorder.count("archive_compensated"), 0);
    assert_eq!(h.recorder.count("archive_completed"), 1);
}

#[tokio::test]
async fn interrupted_live_capture_without_output_fails() {
    let started = Arc::new(Notify::new());
    let signal = started.clone();
    let h = harness(true, move |registry, _| {
        registry.register_fn(ActionKind::DownloadLiveVideo, move |ctx, _target| {
            signal.notify_one();
            async move {
                ctx.cancel.cancelled().await;
                Err::<(), _>(ActionError::Cancelled)
            }
        });
    })
    .await;
    let options = ArchiveOptions {
        archive_chat: false,
        ..Default::default()
    };

    let record = h.service.create_archive_job(live(), options).await.unwrap();
    started.notified().await;
    assert!(h.service.stop_archive_job(&record.id).await.unwrap());
    h.service.wait_for_job(&record.id).await.unwrap();

    let handle = h.service.resume_archive_job(&record.id).await.unwrap();
    let outcome = h.substrate.wait(&handle).await.unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Failed(_)), "{outcome:?}");

    let record = h.record(&record.id).await;
    assert_eq!(record.status(TaskName::VideoDownload), TaskStatus::Failed);
    assert_eq!(h.times(ActionKind::DownloadLiveVideo), 1);
    assert_eq!(h.times(ActionKind::ConvertVideo), 0);
    assert!(h.vods.find(&record.vod_id).await.unwrap().is_some());
    assert_eq!(h.recorder.count("archive_compensated"), 0);
    assert_eq!(h.recorder.count("task_failed"), 1);
}

#[tokio::test]
async fn live_chat_capture_is_not_starved_by_video_downloads() {
    let chat_started = Arc::new(Notify::new());
    let saw_live_stream = Arc::new(AtomicBool::new(false));
    let (started, saw) = (chat_started.clone(), saw_live_stream.clone());
    let concurrency = ConcurrencyConfig {
        live: 1,
        live_chat: 1,
        ..Default::default()
    };
    let h = harness_with(true, concurrency, move |registry, captures| {
        let stop = captures.clone();
        let waiting = started.clone();
        registry.register_fn(ActionKind::DownloadLiveVideo, move |_ctx, target| {
            let captures = stop.clone();
            let chat_started = waiting.clone();
            async move {
                // The broadcast outlasts the wait for chat to start.
                let _ = tokio::time::timeout(Duration::from_secs(2), chat_started.notified()).await;
                captures.finish(&target.archive_id);
                Ok::<(), ActionError>(())
            }
        });
        let watch = captures.clone();
        registry.register_fn(ActionKind::CaptureLiveChat, move |_ctx, target| {
            saw.store(
                watch.state(&target.archive_id) == CaptureState::Running,
                Ordering::SeqCst,
            );
            started.notify_one();
            let rx = watch.subscribe(&target.archive_id);
            async move {
                CaptureRegistry::stopped(rx).await;
                Ok::<(), ActionError>(())
            }
        });
    })
    .await;

    let record = h
        .service
        .create_archive_job(live(), ArchiveOptions::default())
        .await
        .unwrap();
    let outcome = h.service.wait_for_job(&record.id).await.unwrap();
    assert!(outcome.is_completed(), "{outcome:?}");
    assert!(saw_live_stream.load(Ordering::SeqCst));
}
