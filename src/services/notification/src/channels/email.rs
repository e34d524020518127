//! Email notification channel implementation using SMTP

use crate::channels::{ChannelAdapter, ProviderReceipt};
use crate::config::EmailConfig;
use crate::error::{NotificationError, Result};
use crate::templates::RenderedContent;
use async_trait::async_trait;
use edu_core_shared::types::{ChannelKind, Notification, Recipient};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Email channel for sending notifications via SMTP
#[derive(Clone)]
pub struct EmailChannel {
    config: EmailConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_mailbox: Mailbox,
}

impl EmailChannel {
    /// Create a new email channel; no connection is opened until the first send
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let from_mailbox = format!("{} <{}>", config.from_name, config.from_email)
            .parse::<Mailbox>()
            .map_err(|e| NotificationError::config(format!("Invalid from email address: {}", e)))?;

        let mut transport_builder = if config.smtp_use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host).map_err(|e| {
                NotificationError::config(format!("Failed to create SMTP relay: {}", e))
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };

        transport_builder = transport_builder.port(config.smtp_port);

        if !config.smtp_username.is_empty() && !config.smtp_password.is_empty() {
            let creds =
                Credentials::new(config.smtp_username.clone(), config.smtp_password.clone());
            transport_builder = transport_builder.credentials(creds);
        }

        transport_builder = transport_builder
            .pool_config(PoolConfig::new().max_size(10).min_idle(1))
            .timeout(Some(Duration::from_secs(config.timeout_seconds)));

        Ok(Self {
            config: config.clone(),
            transport: transport_builder.build(),
            from_mailbox,
        })
    }

    /// Build an email message; the `email` or `html` template field becomes an
    /// HTML body, otherwise the message is sent as plain text
    fn build_message(&self, address: &str, content: &RenderedContent) -> Result<Message> {
        let to_mailbox = address.parse::<Mailbox>().map_err(|e| {
            NotificationError::channel(ChannelKind::Email, format!("Invalid recipient email: {}", e))
        })?;

        let mut message_builder = Message::builder()
            .from(self.from_mailbox.clone())
            .to(to_mailbox)
            .subject(&content.title);

        if let Some(ref reply_to) = self.config.reply_to {
            let reply_to_mailbox = reply_to
                .parse::<Mailbox>()
                .map_err(|e| NotificationError::config(format!("Invalid reply-to email: {}", e)))?;
            message_builder = message_builder.reply_to(reply_to_mailbox);
        }

        let html = content
            .fields
            .get("html")
            .or_else(|| content.fields.get("email"));

        let message = match html {
            Some(body) => message_builder
                .header(ContentType::TEXT_HTML)
                .body(body.clone()),
            None => message_builder
                .header(ContentType::TEXT_PLAIN)
                .body(content.message.clone()),
        }?;

        Ok(message)
    }
}

#[async_trait]
impl ChannelAdapter for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(
        &self,
        address: &str,
        recipient: &Recipient,
        content: &RenderedContent,
        notification: &Notification,
    ) -> Result<ProviderReceipt> {
        let message = self.build_message(address, content)?;

        match self.transport.send(message).await {
            Ok(response) => {
                debug!(
                    notification_id = %notification.id,
                    user_id = %recipient.id,
                    "Email accepted by SMTP relay"
                );
                let lines: Vec<String> = response.message().map(str::to_string).collect();
                Ok(ProviderReceipt {
                    message_id: lines.first().cloned(),
                    response: Some(json!({
                        "code": response.code().to_string(),
                        "message": lines,
                    })),
                })
            }
            Err(e) => {
                error!(notification_id = %notification.id, error = %e, "SMTP send failed");
                Err(e.into())
            }
        }
    }

    async fn health_check(&self) -> Result<bool> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!("Email channel health check failed: not connected");
                Ok(false)
            }
            Err(e) => {
                info!(error = %e, "Email channel health check error");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn create_test_config() -> EmailConfig {
        EmailConfig {
            enabled: true,
            smtp_host: "localhost".to_string(),
            smtp_port: 2525,
            smtp_username: "test".to_string(),
            smtp_password: "test".to_string(),
            smtp_use_tls: false,
            from_email: "office@school.test".to_string(),
            from_name: "School Office".to_string(),
            reply_to: Some("replies@school.test".to_string()),
            timeout_seconds: 5,
        }
    }

    fn content(fields: BTreeMap<String, String>) -> RenderedContent {
        RenderedContent {
            title: "Parent evening".to_string(),
            message: "Parent evening is on Thursday".to_string(),
            fields,
        }
    }

    #[tokio::test]
    async fn test_email_channel_creation() {
        let channel = EmailChannel::new(&create_test_config());
        assert!(channel.is_ok());
        assert_eq!(channel.unwrap().kind(), ChannelKind::Email);
    }

    #[tokio::test]
    async fn test_invalid_from_address_is_a_config_error() {
        let mut config = create_test_config();
        config.from_email = "not an address".to_string();
        let err = EmailChannel::new(&config).err().unwrap();
        assert!(matches!(err, NotificationError::Config { .. }));
    }

    #[tokio::test]
    async fn test_build_message() {
        let channel = EmailChannel::new(&create_test_config()).unwrap();
        assert!(channel
            .build_message("parent@home.test", &content(BTreeMap::new()))
            .is_ok());

        let mut fields = BTreeMap::new();
        fields.insert("html".to_string(), "<p>Thursday</p>".to_string());
        let message = channel
            .build_message("parent@home.test", &content(fields))
            .unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("text/html"));
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_a_channel_error() {
        let channel = EmailChannel::new(&create_test_config()).unwrap();
        let err = channel
            .build_message("nope", &content(BTreeMap::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            NotificationError::Channel {
                channel: ChannelKind::Email,
                ..
            }
        ));
    }
}
