//! In-app channel
//!
//! The per-user inbox itself is the `user_notifications` projection written by
//! the tracker. This adapter only fans accepted deliveries out to live
//! subscribers (for example a socket gateway) through a tokio broadcast channel.

use crate::channels::{ChannelAdapter, ProviderReceipt};
use crate::config::InAppConfig;
use crate::error::Result;
use crate::templates::RenderedContent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edu_core_shared::types::{
    ChannelKind, Notification, NotificationCategory, NotificationPriority, Recipient,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event pushed to live in-app subscribers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InAppEvent {
    pub user_id: Uuid,
    pub notification_id: Uuid,
    pub title: String,
    pub message: String,
    pub category: NotificationCategory,
    pub priority: NotificationPriority,
    pub created_at: DateTime<Utc>,
}

pub struct InAppChannel {
    sender: broadcast::Sender<InAppEvent>,
}

impl InAppChannel {
    pub fn new(config: &InAppConfig) -> Self {
        Self::with_capacity(config.buffer_size)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InAppEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl ChannelAdapter for InAppChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::InApp
    }

    async fn send(
        &self,
        _address: &str,
        recipient: &Recipient,
        content: &RenderedContent,
        notification: &Notification,
    ) -> Result<ProviderReceipt> {
        let event = InAppEvent {
            user_id: recipient.id,
            notification_id: notification.id,
            title: content.title.clone(),
            message: content.body_for(ChannelKind::InApp).to_string(),
            category: notification.category,
            priority: notification.priority,
            created_at: Utc::now(),
        };

        // No live subscriber is not a failure: the inbox row is still written.
        let live = self.sender.send(event).unwrap_or(0);

        Ok(ProviderReceipt {
            message_id: None,
            response: Some(json!({ "live_subscribers": live })),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edu_core_shared::types::{NotificationStatus, SubmitNotificationRequest};
    use std::collections::BTreeMap;

    fn fixtures() -> (Recipient, Notification, RenderedContent) {
        let recipient = Recipient {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            role: "TEACHER".to_string(),
            display_name: None,
            email: None,
            phone: None,
            parent_phone: None,
            staff_phone: None,
            is_active: true,
        };
        let request: SubmitNotificationRequest = serde_json::from_value(json!({
            "tenant_id": recipient.tenant_id,
            "title": "Staff meeting",
            "message": "Staff room at 15:30",
            "channels": ["IN_APP"],
            "target_type": "ALL_USERS"
        }))
        .unwrap();
        let notification =
            Notification::from_request(request, NotificationStatus::Sending, Utc::now());
        let content = RenderedContent {
            title: "Staff meeting".to_string(),
            message: "Staff room at 15:30".to_string(),
            fields: BTreeMap::new(),
        };
        (recipient, notification, content)
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let channel = InAppChannel::with_capacity(16);
        let mut receiver = channel.subscribe();
        let (recipient, notification, content) = fixtures();

        let receipt = channel
            .send(&recipient.id.to_string(), &recipient, &content, &notification)
            .await
            .unwrap();
        assert_eq!(receipt.response.unwrap()["live_subscribers"], 1);

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.user_id, recipient.id);
        assert_eq!(event.notification_id, notification.id);
        assert_eq!(event.title, "Staff meeting");
    }

    #[tokio::test]
    async fn test_send_without_subscribers_succeeds() {
        let channel = InAppChannel::with_capacity(4);
        let (recipient, notification, content) = fixtures();
        assert_eq!(channel.subscriber_count(), 0);
        assert!(channel
            .send(&recipient.id.to_string(), &recipient, &content, &notification)
            .await
            .is_ok());
    }
}
