//! Live capture coordination.
//!
//! The live video download and the live chat capture run in different
//! sub-executions. Start is ordered by the `start-capture` signal; stop is
//! driven from here: when the video side learns the stream ended (or never
//! existed) it flips the capture state, and the chat capture action watching
//! that state stops its process.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::database::models::ArchiveContext;
use crate::database::repositories::{ChannelRepository, VodRepository};
use crate::platform::PlatformClient;

/// Stop state of one archive's live chat capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CaptureState {
    Running,
    /// The stream ended; capture should stop and report success.
    Finished,
    /// There was never a stream; capture should stop without success.
    Aborted,
}

/// In-process capture stop switches, keyed by archive id.
#[derive(Default)]
pub struct CaptureRegistry {
    captures: DashMap<String, watch::Sender<CaptureState>>,
}

impl CaptureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, archive_id: &str) -> watch::Sender<CaptureState> {
        self.captures
            .entry(archive_id.to_string())
            .or_insert_with(|| watch::channel(CaptureState::Running).0)
            .clone()
    }

    /// Watch the capture state. A stop that already happened is visible
    /// immediately.
    pub fn subscribe(&self, archive_id: &str) -> watch::Receiver<CaptureState> {
        self.sender(archive_id).subscribe()
    }

    pub fn state(&self, archive_id: &str) -> CaptureState {
        *self.sender(archive_id).borrow()
    }

    pub fn finish(&self, archive_id: &str) {
        self.set(archive_id, CaptureState::Finished);
    }

    pub fn abort(&self, archive_id: &str) {
        self.set(archive_id, CaptureState::Aborted);
    }

    fn set(&self, archive_id: &str, state: CaptureState) {
        let sender = self.sender(archive_id);
        let changed = sender.send_if_modified(|current| {
            // The first stop wins.
            if *current == CaptureState::Running {
                *current = state;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(archive_id, %state, "Live chat capture stop requested");
        }
    }

    /// Forget an archive once nothing can be capturing for it.
    pub fn remove(&self, archive_id: &str) {
        self.captures.remove(archive_id);
    }

    /// Wait until the capture has been told to stop.
    pub async fn stopped(mut rx: watch::Receiver<CaptureState>) -> CaptureState {
        match rx.wait_for(|state| *state != CaptureState::Running).await {
            Ok(state) => *state,
            // The registry entry was removed; treat as finished.
            Err(_) => CaptureState::Finished,
        }
    }
}

/// Reacts to the end of a live video download.
pub struct LiveCoordinator {
    captures: Arc<CaptureRegistry>,
    channels: Arc<dyn ChannelRepository>,
    vods: Arc<dyn VodRepository>,
    platform: Arc<dyn PlatformClient>,
}

impl LiveCoordinator {
    pub fn new(
        captures: Arc<CaptureRegistry>,
        channels: Arc<dyn ChannelRepository>,
        vods: Arc<dyn VodRepository>,
        platform: Arc<dyn PlatformClient>,
    ) -> Self {
        Self {
            captures,
            channels,
            vods,
            platform,
        }
    }

    pub fn captures(&self) -> &Arc<CaptureRegistry> {
        &self.captures
    }

    /// The stream ended normally.
    ///
    /// Stops chat capture, clears the channel's live flag and tries to point
    /// the VOD row at the video the platform published for this stream.
    /// Correlation failure keeps the stream id.
    pub async fn stream_ended(&self, ctx: &ArchiveContext) {
        let archive_id = ctx.record.id.as_str();
        info!(archive_id, channel = %ctx.channel.login, "Live stream ended");
        self.captures.finish(archive_id);

        if let Err(e) = self.channels.set_live(&ctx.channel.id, false).await {
            warn!(archive_id, error = %e, "Failed to clear channel live flag");
        }

        let stream_id = ctx
            .vod
            .external_stream_id
            .as_deref()
            .unwrap_or(&ctx.vod.external_id);
        match self
            .platform
            .find_vod_for_stream(&ctx.channel.external_id, stream_id)
            .await
        {
            Ok(Some(video_id)) => {
                if let Err(e) = self.vods.set_external_id(&ctx.vod.id, &video_id).await {
                    warn!(archive_id, error = %e, "Failed to record correlated video id");
                } else {
                    info!(archive_id, stream_id, video_id = %video_id, "Correlated live stream to video");
                }
            }
            Ok(None) => {
                warn!(archive_id, stream_id, "No video found for live stream, keeping stream id");
            }
            Err(e) => {
                warn!(archive_id, stream_id, error = %e, "Live stream correlation failed, keeping stream id");
            }
        }
    }

    /// The channel had no playable stream. Stops any capture without success.
    pub fn no_stream(&self, archive_id: &str) {
        self.captures.abort(archive_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_before_subscribe_is_observed() {
        let registry = CaptureRegistry::new();
        registry.finish("a");
        let state = CaptureRegistry::stopped(registry.subscribe("a")).await;
        assert_eq!(state, CaptureState::Finished);
    }

    #[tokio::test]
    async fn first_stop_wins() {
        let registry = CaptureRegistry::new();
        let rx = registry.subscribe("a");
        registry.abort("a");
        registry.finish("a");
        assert_eq!(CaptureRegistry::stopped(rx).await, CaptureState::Aborted);
        assert_eq!(registry.state("a"), CaptureState::Aborted);
    }

    #[tokio::test]
    async fn archives_are_independent() {
        let registry = CaptureRegistry::new();
        registry.finish("a");
        assert_eq!(registry.state("b"), CaptureState::Running);
    }
}
