//! SMS notification channel implementation over an HTTP gateway

use crate::channels::{ChannelAdapter, ProviderReceipt};
use crate::config::SmsConfig;
use crate::error::{NotificationError, Result};
use crate::templates::RenderedContent;
use async_trait::async_trait;
use edu_core_shared::types::{ChannelKind, Notification, Recipient};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Longest body sent in a single message; longer text is truncated
const MAX_SMS_CHARS: usize = 480;

/// SMS channel posting messages to a provider gateway
#[derive(Clone)]
pub struct SmsChannel {
    config: SmsConfig,
    client: Client,
}

impl SmsChannel {
    pub fn new(config: &SmsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| NotificationError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    /// `sms` template field if present, else `title: message`
    fn body(content: &RenderedContent) -> String {
        let text = match content.fields.get("sms") {
            Some(sms) => sms.clone(),
            None if content.title.is_empty() => content.message.clone(),
            None => format!("{}: {}", content.title, content.message),
        };
        text.chars().take(MAX_SMS_CHARS).collect()
    }
}

#[async_trait]
impl ChannelAdapter for SmsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
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
                ChannelKind::Sms,
                "SMS gateway URL is not configured",
            ));
        }

        let payload = json!({
            "to": address,
            "from": self.config.sender_id,
            "body": Self::body(content),
            "reference": notification.id,
        });

        let response = self
            .client
            .post(&self.config.gateway_url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                notification_id = %notification.id,
                user_id = %recipient.id,
                status = %status,
                "SMS gateway rejected message"
            );
            return Err(NotificationError::channel(
                ChannelKind::Sms,
                format!("HTTP {} - {}", status, body),
            ));
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message_id = body
            .get("message_id")
            .or_else(|| body.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        debug!(notification_id = %notification.id, user_id = %recipient.id, "SMS accepted");
        Ok(ProviderReceipt {
            message_id,
            response: Some(body),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.config.gateway_url.is_empty())
    }
}
