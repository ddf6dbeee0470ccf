//! Notification fan-out.

use std::sync::Arc;
use tracing::{debug, warn};

use super::channels::{LogChannel, NotificationChannel, WebhookChannel, WebhookConfig};
use super::events::ArchiveEvent;

/// Delivers archive events to every enabled channel.
#[derive(Clone)]
pub struct NotificationService {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationService {
    /// Service with only the log channel.
    pub fn new() -> Self {
        Self {
            channels: vec![Arc::new(LogChannel)],
        }
    }

    /// Log channel plus a webhook when a URL is configured.
    pub fn from_webhook_url(webhook_url: Option<&str>) -> Self {
        let mut service = Self::new();
        if let Some(url) = webhook_url {
            service.add_channel(Arc::new(WebhookChannel::new(WebhookConfig::for_url(url))));
        }
        service
    }

    pub fn add_channel(&mut self, channel: Arc<dyn NotificationChannel>) -> &mut Self {
        self.channels.push(channel);
        self
    }

    /// Send an event to every enabled channel. Channel errors are logged.
    pub async fn notify(&self, event: ArchiveEvent) {
        debug!(
            event_type = event.event_type(),
            archive_id = event.archive_id(),
            "Dispatching notification"
        );
        for channel in self.channels.iter().filter(|c| c.is_enabled()) {
            if let Err(e) = channel.send(&event).await {
                warn!(
                    channel = channel.channel_type(),
                    event_type = event.event_type(),
                    error = %e,
                    "Failed to deliver notification"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use crate::database::models::ArchiveMode;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    #[async_trait]
    impl NotificationChannel for Recording {
        fn channel_type(&self) -> &'static str {
            "recording"
        }
        fn is_enabled(&self) -> bool {
            true
        }
        async fn send(&self, event: &ArchiveEvent) -> Result<()> {
            self.0.lock().push(event.event_type().to_string());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl NotificationChannel for Broken {
        fn channel_type(&self) -> &'static str {
            "broken"
        }
        fn is_enabled(&self) -> bool {
            true
        }
        async fn send(&self, _event: &ArchiveEvent) -> Result<()> {
            Err(crate::Error::Other("down".into()))
        }
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_others() {
        let recording = Arc::new(Recording::default());
        let mut service = NotificationService::new();
        service.add_channel(Arc::new(Broken));
        service.add_channel(recording.clone());

        service
            .notify(ArchiveEvent::ArchiveCompleted {
                archive_id: "a".into(),
                vod_id: "v".into(),
                mode: ArchiveMode::Vod,
                timestamp: Utc::now(),
            })
            .await;

        assert_eq!(recording.0.lock().as_slice(), ["archive_completed"]);
    }
}
