//! Push notification channel implementation over an HTTP push gateway
//!
//! The gateway resolves the user id to device tokens; this service never
//! stores tokens itself.

use crate::channels::{ChannelAdapter, ProviderReceipt};
use crate::config::PushConfig;
use crate::error::{NotificationError, Result};
use crate::templates::RenderedContent;
use async_trait::async_trait;
use edu_core_shared::types::{ChannelKind, Notification, Recipient};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct PushChannel {
    config: PushConfig,
    client: Client,
}

impl PushChannel {
    pub fn new(config: &PushConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| NotificationError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn payload(address: &str, content: &RenderedContent, notification: &Notification) -> Value {
        json!({
            "to": address,
            "notification": {
                "title": content.title,
                "body": content.body_for(ChannelKind::Push),
            },
            "data": {
                "notification_id": notification.id,
                "type": notification.notification_type,
                "category": notification.category,
                "priority": notification.priority,
            },
            "priority": if notification.priority.overrides_quiet_hours() { "high" } else { "normal" },
        })
    }
}

#[async_trait]
impl ChannelAdapter for PushChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn send(
        &self,
        address: &str,
        recipient: &Recipient,
        content: &RenderedContent,
        notification: &Notification,
    ) -> Result<ProviderReceipt> {
        if self.config.gateway_url.is_empty() {
            return Err(NotificationError::channel(
                ChannelKind::Push,
                "Push gateway URL is not configured",
            ));
        }

        let response = self
            .client
            .post(&self.config.gateway_url)
            .header("Authorization", format!("key={}", self.config.server_key))
            .json(&Self::payload(address, content, notification))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::channel(
                ChannelKind::Push,
                format!("HTTP {} - {}", status, body),
            ));
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        // FCM-style gateways report per-message failures inside a 200 response.
        if body.get("failure").and_then(Value::as_u64).unwrap_or(0) > 0 {
            return Err(NotificationError::channel(
                ChannelKind::Push,
                format!("Push gateway reported failure: {}", body),
            ));
        }

        debug!(notification_id = %notification.id, user_id = %recipient.id, "Push accepted");
        Ok(ProviderReceipt {
            message_id: body
                .get("message_id")
                .or_else(|| body.get("multicast_id"))
                .map(|id| match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
            response: Some(body),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.config.gateway_url.is_empty())
    }
}
