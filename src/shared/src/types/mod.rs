//! Shared type definitions for the EDU-CORE notification platform
//!
//! Every enum in this module is persisted by its verbatim string value, so
//! renaming a variant's wire value is a breaking change for stored data.

pub mod directory;
pub mod notification;
pub mod preferences;
pub mod tracking;

pub use directory::{Recipient, Student, StudentStatus};
pub use notification::{
    ChannelKind, Notification, NotificationCategory, NotificationPriority, NotificationStatus,
    ProcessSummary, RecipientOutcome, SubmitNotificationRequest, SubmitNotificationResponse,
    TargetType,
};
pub use preferences::{
    ChannelToggles, ChannelTogglesUpdate, QuietDay, UpdatePreferencesRequest,
    UserNotificationPreferences,
};
pub use tracking::{
    ChannelDeliveryStats, DeliveryLog, DeliveryStats, DeliveryStatus, Page, PaginationInfo,
    UserNotification, UserNotificationQuery, UserNotificationView,
};

use thiserror::Error;

/// Raised when a persisted enum value does not match any known variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}
