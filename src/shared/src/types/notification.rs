//! Notification entity, its persisted enums and the dispatch DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

use super::ParseEnumError;

// =============================================================================
// Persisted enums
// =============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
    Critical,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Urgent => "URGENT",
            Self::Critical => "CRITICAL",
        }
    }

    /// Priorities that are delivered even inside a recipient's quiet hours.
    ///
    /// HIGH is deliberately not part of this set.
    pub fn overrides_quiet_hours(&self) -> bool {
        matches!(self, Self::Urgent | Self::Critical)
    }
}

impl fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationPriority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Self::Low),
            "NORMAL" => Ok(Self::Normal),
            "HIGH" => Ok(Self::High),
            "URGENT" => Ok(Self::Urgent),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(ParseEnumError::new("priority", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationCategory {
    Academic,
    Attendance,
    Financial,
    Event,
    System,
    Safety,
    #[default]
    General,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Academic => "ACADEMIC",
            Self::Attendance => "ATTENDANCE",
            Self::Financial => "FINANCIAL",
            Self::Event => "EVENT",
            Self::System => "SYSTEM",
            Self::Safety => "SAFETY",
            Self::General => "GENERAL",
        }
    }
}

impl fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationCategory {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACADEMIC" => Ok(Self::Academic),
            "ATTENDANCE" => Ok(Self::Attendance),
            "FINANCIAL" => Ok(Self::Financial),
            "EVENT" => Ok(Self::Event),
            "SYSTEM" => Ok(Self::System),
            "SAFETY" => Ok(Self::Safety),
            "GENERAL" => Ok(Self::General),
            other => Err(ParseEnumError::new("category", other)),
        }
    }
}

/// Lifecycle of a notification.
///
/// `PENDING -> SENDING -> {SENT, PARTIALLY_SENT, FAILED}` for immediate sends,
/// `PENDING -> SCHEDULED -> SENDING -> ...` for deferred ones, and
/// `SCHEDULED -> CANCELLED` on explicit cancel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Scheduled,
    Sending,
    Sent,
    PartiallySent,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Scheduled => "SCHEDULED",
            Self::Sending => "SENDING",
            Self::Sent => "SENT",
            Self::PartiallySent => "PARTIALLY_SENT",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Only these states may enter the dispatch pipeline.
    pub fn is_processable(&self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Sent | Self::PartiallySent | Self::Failed | Self::Cancelled
        )
    }

    /// Final status from the per-(channel, user) tallies of one dispatch run.
    pub fn from_outcome(success_count: u64, failure_count: u64) -> Self {
        if failure_count == 0 {
            Self::Sent
        } else if success_count == 0 {
            Self::Failed
        } else {
            Self::PartiallySent
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SCHEDULED" => Ok(Self::Scheduled),
            "SENDING" => Ok(Self::Sending),
            "SENT" => Ok(Self::Sent),
            "PARTIALLY_SENT" => Ok(Self::PartiallySent),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(ParseEnumError::new("status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    AllUsers,
    SpecificUsers,
    RoleBased,
    ClassBased,
    Combined,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllUsers => "ALL_USERS",
            Self::SpecificUsers => "SPECIFIC_USERS",
            Self::RoleBased => "ROLE_BASED",
            Self::ClassBased => "CLASS_BASED",
            Self::Combined => "COMBINED",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALL_USERS" => Ok(Self::AllUsers),
            "SPECIFIC_USERS" => Ok(Self::SpecificUsers),
            "ROLE_BASED" => Ok(Self::RoleBased),
            "CLASS_BASED" => Ok(Self::ClassBased),
            "COMBINED" => Ok(Self::Combined),
            other => Err(ParseEnumError::new("target type", other)),
        }
    }
}

/// Delivery transport key. Each key maps to one registered channel adapter.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelKind {
    Email,
    Sms,
    Push,
    InApp,
    Webhook,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 5] = [
        ChannelKind::Email,
        ChannelKind::Sms,
        ChannelKind::Push,
        ChannelKind::InApp,
        ChannelKind::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
            Self::Push => "PUSH",
            Self::InApp => "IN_APP",
            Self::Webhook => "WEBHOOK",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EMAIL" => Ok(Self::Email),
            "SMS" => Ok(Self::Sms),
            "PUSH" => Ok(Self::Push),
            "IN_APP" => Ok(Self::InApp),
            "WEBHOOK" => Ok(Self::Webhook),
            other => Err(ParseEnumError::new("channel", other)),
        }
    }
}

// =============================================================================
// Notification entity
// =============================================================================

/// One dispatch request, persisted for its whole lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub title: String,
    pub message: String,
    pub notification_type: String,
    pub priority: NotificationPriority,
    pub category: NotificationCategory,
    pub channels: Vec<ChannelKind>,
    pub target_type: TargetType,
    pub target_user_ids: Vec<Uuid>,
    pub target_roles: Vec<String>,
    pub target_class_ids: Vec<Uuid>,
    pub template_id: Option<String>,
    pub template_data: Option<serde_json::Value>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: NotificationStatus,
    pub total_targets: i64,
    pub read_count: i64,
    pub error_message: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Build a fresh row from a validated request.
    pub fn from_request(
        request: SubmitNotificationRequest,
        status: NotificationStatus,
        now: DateTime<Utc>,
    ) -> Self {
        let mut channels = request.channels;
        let mut seen = std::collections::HashSet::new();
        channels.retain(|c| seen.insert(*c));

        Self {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            title: request.title,
            message: request.message,
            notification_type: request.notification_type,
            priority: request.priority,
            category: request.category,
            channels,
            target_type: request.target_type,
            target_user_ids: request.target_user_ids,
            target_roles: request.target_roles,
            target_class_ids: request.target_class_ids,
            template_id: request.template_id,
            template_data: request.template_data,
            scheduled_at: request.scheduled_at,
            expires_at: request.expires_at,
            status,
            total_targets: 0,
            read_count: 0,
            error_message: None,
            created_by: request.created_by,
            created_at: now,
            updated_at: now,
            sent_at: None,
            delivered_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

// =============================================================================
// Dispatch DTOs
// =============================================================================

fn default_notification_type() -> String {
    "GENERAL".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitNotificationRequest {
    pub tenant_id: Uuid,
    #[validate(length(min = 1, max = 255, message = "title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "message is required"))]
    pub message: String,
    #[serde(default = "default_notification_type")]
    #[validate(length(min = 1, max = 100))]
    pub notification_type: String,
    #[serde(default)]
    pub priority: NotificationPriority,
    #[serde(default)]
    pub category: NotificationCategory,
    #[validate(length(min = 1, message = "at least one channel is required"))]
    pub channels: Vec<ChannelKind>,
    pub target_type: TargetType,
    #[serde(default)]
    pub target_user_ids: Vec<Uuid>,
    #[serde(default)]
    pub target_roles: Vec<String>,
    #[serde(default)]
    pub target_class_ids: Vec<Uuid>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_data: Option<serde_json::Value>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitNotificationResponse {
    pub notification_id: Uuid,
    pub status: NotificationStatus,
    /// Present when the notification was processed immediately.
    pub summary: Option<ProcessSummary>,
}

/// Outcome of one `(channel, user)` delivery attempt, without provider payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipientOutcome {
    pub user_id: Uuid,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSummary {
    pub notification_id: Uuid,
    pub status: NotificationStatus,
    pub targets_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub results: BTreeMap<ChannelKind, Vec<RecipientOutcome>>,
}

impl ProcessSummary {
    pub fn empty(notification_id: Uuid) -> Self {
        Self {
            notification_id,
            status: NotificationStatus::Sent,
            targets_count: 0,
            success_count: 0,
            failure_count: 0,
            results: BTreeMap::new(),
        }
    }
}
