//! Delivery audit rows, per-user tracking rows and their read models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::notification::{ChannelKind, NotificationCategory, NotificationPriority, RecipientOutcome};
use super::ParseEnumError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DELIVERED" => Ok(Self::Delivered),
            "FAILED" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("delivery status", other)),
        }
    }
}

/// Append-only record of one attempt on one channel to one recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryLog {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub user_id: Uuid,
    pub channel: ChannelKind,
    /// Email address, phone number or user id depending on the channel.
    pub recipient: String,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub provider_response: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl DeliveryLog {
    pub fn delivered(
        notification_id: Uuid,
        user_id: Uuid,
        channel: ChannelKind,
        recipient: String,
        provider_message_id: Option<String>,
        provider_response: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_id,
            user_id,
            channel,
            recipient,
            status: DeliveryStatus::Delivered,
            provider_message_id,
            provider_response,
            error_message: None,
            sent_at: Some(at),
            failed_at: None,
        }
    }

    pub fn failed(
        notification_id: Uuid,
        user_id: Uuid,
        channel: ChannelKind,
        recipient: String,
        error: String,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_id,
            user_id,
            channel,
            recipient,
            status: DeliveryStatus::Failed,
            provider_message_id: None,
            provider_response: None,
            error_message: Some(error),
            sent_at: None,
            failed_at: Some(at),
        }
    }
}

/// Per-(notification, user) tracking row; the in-app inbox projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserNotification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub notification_id: Uuid,
    pub is_delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    /// Snapshot of this user's per-channel outcomes.
    pub channel_data: BTreeMap<ChannelKind, RecipientOutcome>,
    pub created_at: DateTime<Utc>,
}

/// A tracking row joined with the fields of its notification an inbox needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserNotificationView {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub title: String,
    pub message: String,
    pub notification_type: String,
    pub category: NotificationCategory,
    pub priority: NotificationPriority,
    pub is_delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserNotificationQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default, rename = "type")]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub category: Option<NotificationCategory>,
}

impl Default for UserNotificationQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
            unread_only: false,
            notification_type: None,
            category: None,
        }
    }
}

impl UserNotificationQuery {
    pub const MAX_LIMIT: u32 = 100;

    /// Page clamped to >= 1 and limit clamped to `1..=MAX_LIMIT`.
    pub fn normalized(&self) -> (u32, u32) {
        (self.page.max(1), self.limit.clamp(1, Self::MAX_LIMIT))
    }

    pub fn offset(&self) -> u64 {
        let (page, limit) = self.normalized();
        u64::from(page - 1) * u64::from(limit)
    }
}

/// Pagination information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaginationInfo {
    pub page: u32,
    pub limit: u32,
    pub total_items: u64,
    pub total_pages: u32,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

impl PaginationInfo {
    pub fn new(page: u32, limit: u32, total_items: u64) -> Self {
        let total_pages = if limit == 0 {
            0
        } else {
            total_items.div_ceil(u64::from(limit)) as u32
        };
        Self {
            page,
            limit,
            total_items,
            total_pages,
            has_next_page: page < total_pages,
            has_previous_page: page > 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: PaginationInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChannelDeliveryStats {
    pub delivered: u64,
    pub failed: u64,
}

/// Aggregated view of a notification's delivery log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryStats {
    pub notification_id: Uuid,
    pub total_targets: i64,
    pub read_count: i64,
    pub channels: BTreeMap<ChannelKind, ChannelDeliveryStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_info() {
        let info = PaginationInfo::new(2, 20, 45);
        assert_eq!(info.total_pages, 3);
        assert!(info.has_next_page);
        assert!(info.has_previous_page);

        let info = PaginationInfo::new(1, 20, 0);
        assert_eq!(info.total_pages, 0);
        assert!(!info.has_next_page);
        assert!(!info.has_previous_page);
    }

    #[test]
    fn test_query_normalization() {
        let query = UserNotificationQuery {
            page: 0,
            limit: 500,
            ..Default::default()
        };
        assert_eq!(query.normalized(), (1, 100));
        assert_eq!(query.offset(), 0);

        let query = UserNotificationQuery {
            page: 3,
            limit: 10,
            ..Default::default()
        };
        assert_eq!(query.offset(), 20);
    }

    #[test]
    fn test_query_accepts_type_alias() {
        let query: UserNotificationQuery =
            serde_json::from_str(r#"{"type":"GRADE_UPDATE","unread_only":true}"#).unwrap();
        assert_eq!(query.notification_type.as_deref(), Some("GRADE_UPDATE"));
        assert!(query.unread_only);
        assert_eq!(query.page, 1);
        assert_eq!(query.limit, 20);
    }
}
