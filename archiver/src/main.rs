use std::sync::Arc;
use std::time::Duration;
use vod_archiver::actions::paths::ArtifactLayout;
use vod_archiver::actions::{ActionDeps, register_default_actions};
use vod_archiver::config::ArchiverConfig;
use vod_archiver::database::repositories::{
    SqlxArchiveRepository, SqlxChannelRepository, SqlxSignalRepository, SqlxVodRepository,
};
use vod_archiver::database;
use vod_archiver::notification::NotificationService;
use vod_archiver::pipeline::{
    ActionRegistry, ArchiveService, CaptureRegistry, LiveCoordinator, ServiceDeps,
};
use vod_archiver::platform::TwitchClient;
use vod_archiver::substrate::LocalSubstrate;
use vod_archiver::{logging, utils};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = ArchiverConfig::from_env()?;

    // Held until exit so buffered log lines are flushed.
    let _log_guard = logging::init_logging(&config.log)?;
    if let Some(dir) = config.log.dir.clone() {
        tokio::spawn(async move {
            match logging::cleanup_old_logs(&dir).await {
                Ok(deleted) if deleted > 0 => tracing::info!(deleted, "Removed old log files"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to clean up old log files"),
            }
        });
    }
    utils::http_client::install_rustls_provider();

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let archives = Arc::new(SqlxArchiveRepository::new(pool.clone()));
    let vods = Arc::new(SqlxVodRepository::new(pool.clone()));
    let channels = Arc::new(SqlxChannelRepository::new(pool.clone()));
    let signals = Arc::new(SqlxSignalRepository::new(pool.clone()));

    let substrate = Arc::new(LocalSubstrate::new(signals.clone(), &config.concurrency));
    let platform = Arc::new(TwitchClient::new(config.twitch.clone())?);
    let captures = Arc::new(CaptureRegistry::new());
    let coordinator = Arc::new(LiveCoordinator::new(
        captures.clone(),
        channels.clone(),
        vods.clone(),
        platform.clone(),
    ));
    let layout = ArtifactLayout::new(&config.videos_dir, &config.temp_dir);

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
            tools: config.tools.clone(),
            http: utils::http_client::build_client(Duration::from_secs(60))?,
        }),
    );

    let service = ArchiveService::new(ServiceDeps {
        archives,
        vods,
        channels,
        signals,
        substrate,
        platform,
        captures,
        registry,
        policies: config.policies.clone(),
        heartbeat_interval: config.heartbeat_interval,
        live_thumbnail_delay: config.live_thumbnail_delay,
        layout,
        chat_capture_tool: config.tools.chat_downloader.clone(),
        notifications: NotificationService::from_webhook_url(config.webhook_url.as_deref()),
    });

    let resumed = service.resume_incomplete().await?;
    tracing::info!(
        resumed,
        videos_dir = %config.videos_dir.display(),
        "vod-archiver started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    pool.close().await;
    Ok(())
}
