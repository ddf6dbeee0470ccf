//! Generic webhook notification channel.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::NotificationChannel;
use crate::Result;
use crate::notification::events::{ArchiveEvent, NotificationPriority};

/// Webhook channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Whether the channel is enabled.
    pub enabled: bool,
    /// Webhook URL.
    pub url: String,
    /// Optional bearer token.
    pub bearer_token: Option<String>,
    /// Minimum priority level to send (default: Normal).
    #[serde(default)]
    pub min_priority: NotificationPriority,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

impl WebhookConfig {
    /// Enabled webhook posting every event at or above Normal to `url`.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            bearer_token: None,
            min_priority: NotificationPriority::Normal,
            timeout_secs: default_timeout(),
        }
    }
}

/// Generic webhook notification channel.
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    /// Create a new Webhook channel.
    pub fn new(config: WebhookConfig) -> Self {
        crate::utils::http_client::install_rustls_provider();
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    /// Build the JSON payload.
    fn build_payload(&self, event: &ArchiveEvent) -> serde_json::Value {
        json!({
            "event_type": event.event_type(),
            "priority": event.priority().to_string(),
            "title": event.title(),
            "description": event.description(),
            "timestamp": event.timestamp().to_rfc3339(),
            "archive_id": event.archive_id(),
            "data": event
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn channel_type(&self) -> &'static str {
        "webhook"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.url.is_empty()
    }

    async fn send(&self, event: &ArchiveEvent) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        if event.priority() < self.config.min_priority {
            debug!(
                event_type = event.event_type(),
                priority = %event.priority(),
                "Skipping webhook notification below minimum priority"
            );
            return Ok(());
        }

        let mut request = self.client.post(&self.config.url).json(&self.build_payload(event));
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| crate::Error::Other(format!("Webhook request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = %body, "Webhook failed");
            return Err(crate::Error::Other(format!("Webhook failed: {status} - {body}")));
        }

        debug!(event_type = event.event_type(), "Webhook notification sent");
        Ok(())
    }
}
