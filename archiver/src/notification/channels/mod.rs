//! Notification channels.

mod webhook;

pub use webhook::{WebhookChannel, WebhookConfig};

use async_trait::async_trait;
use tracing::{info, warn};

use super::events::{ArchiveEvent, NotificationPriority};
use crate::Result;

/// Trait for notification channels.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Get the channel type name.
    fn channel_type(&self) -> &'static str;

    /// Check if the channel is enabled.
    fn is_enabled(&self) -> bool;

    /// Send a notification through this channel.
    async fn send(&self, event: &ArchiveEvent) -> Result<()>;
}

/// Writes every event to the log. Always enabled.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn channel_type(&self) -> &'static str {
        "log"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &ArchiveEvent) -> Result<()> {
        if event.priority() >= NotificationPriority::High {
            warn!(
                event_type = event.event_type(),
                archive_id = event.archive_id(),
                "{}: {}",
                event.title(),
                event.description()
            );
        } else {
            info!(
                event_type = event.event_type(),
                archive_id = event.archive_id(),
                "{}: {}",
                event.title(),
                event.description()
            );
        }
        Ok(())
    }
}
