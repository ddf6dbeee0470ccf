//! Archive notifications.
//!
//! Events are fanned out to every configured channel. Delivery failures are
//! logged and never reach the pipeline.

pub mod channels;
pub mod events;
pub mod service;

pub use channels::{LogChannel, NotificationChannel, WebhookChannel, WebhookConfig};
pub use events::{ArchiveEvent, NotificationPriority};
pub use service::NotificationService;
