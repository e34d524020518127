//! Webhook notification channel implementation using HTTP POST

use crate::channels::{ChannelAdapter, ProviderReceipt};
use crate::config::WebhookConfig;
use crate::error::{NotificationError, Result};
use crate::templates::RenderedContent;
use async_trait::async_trait;
use edu_core_shared::types::{ChannelKind, Notification, Recipient};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};

/// Webhook channel for sending notifications via HTTP POST
#[derive(Clone)]
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(&config.user_agent)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| {
                NotificationError::config(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn envelope(
        address: &str,
        recipient: &Recipient,
        content: &RenderedContent,
        notification: &Notification,
    ) -> Value {
        json!({
            "event": "notification.delivery",
            "notification_id": notification.id,
            "tenant_id": notification.tenant_id,
            "recipient": {
                "user_id": recipient.id,
                "address": address,
                "role": recipient.role,
            },
            "type": notification.notification_type,
            "category": notification.category,
            "priority": notification.priority,
            "title": content.title,
            "message": content.body_for(ChannelKind::Webhook),
            "timestamp": chrono::Utc::now(),
        })
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<Value> {
        let response = self.client.post(url).json(payload).send().await?;

        let status = response.status();
        if status.is_success() {
            let body = response.text().await.unwrap_or_default();
            Ok(json!({ "url": url, "status": status.as_u16(), "body": body }))
        } else {
            Err(NotificationError::channel(
                ChannelKind::Webhook,
                format!(
                    "HTTP {} - {}",
                    status,
                    response.text().await.unwrap_or_default()
                ),
            ))
        }
    }
}

#[async_trait]
impl ChannelAdapter for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    /// Posts to every configured endpoint; succeeds if at least one accepted
    async fn send(
        &self,
        address: &str,
        recipient: &Recipient,
        content: &RenderedContent,
        notification: &Notification,
    ) -> Result<ProviderReceipt> {
        if self.config.endpoints.is_empty() {
            return Err(NotificationError::channel(
                ChannelKind::Webhook,
                "No webhook endpoints configured",
            ));
        }

        let payload = Self::envelope(address, recipient, content, notification);
        let mut accepted = Vec::new();
        let mut errors = Vec::new();

        for url in &self.config.endpoints {
            match self.post(url, &payload).await {
                Ok(result) => accepted.push(result),
                Err(e) => {
                    error!(notification_id = %notification.id, url = %url, error = %e, "Webhook delivery failed");
                    errors.push(format!("{}: {}", url, e));
                }
            }
        }

        if accepted.is_empty() {
            return Err(NotificationError::channel(
                ChannelKind::Webhook,
                format!("All webhook deliveries failed: {}", errors.join("; ")),
            ));
        }

        info!(
            notification_id = %notification.id,
            accepted = accepted.len(),
            failed = errors.len(),
            "Webhook delivered"
        );
        Ok(ProviderReceipt {
            message_id: None,
            response: Some(json!({ "accepted": accepted, "errors": errors })),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.config.endpoints.is_empty())
    }
}
