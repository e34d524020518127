//! Persistence seams of the dispatch engine
//!
//! The orchestrator only talks to these traits. `MemoryStore` backs tests and
//! single-process deployments; `PostgresStore` is the production store.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edu_core_shared::types::{
    ChannelDeliveryStats, ChannelKind, DeliveryLog, Notification, NotificationStatus, Page,
    Recipient, UserNotification, UserNotificationPreferences, UserNotificationQuery,
    UserNotificationView,
};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Result of a single mark-as-read call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Newly marked; the notification's read counter was incremented
    Marked,
    AlreadyRead,
    /// No tracking row for this (notification, user)
    NotFound,
}

/// Final figures written when a dispatch run completes
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub status: NotificationStatus,
    pub total_targets: i64,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_notification(&self, notification: &Notification) -> Result<()>;

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>>;

    /// Conditional status change; returns `false` when the current status is
    /// not in `from`. Entering SENDING stamps `sent_at`.
    async fn transition_status(
        &self,
        id: Uuid,
        from: &[NotificationStatus],
        to: NotificationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn complete_notification(
        &self,
        id: Uuid,
        outcome: &DispatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn mark_failed(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()>;

    /// Append-only audit rows
    async fn append_delivery_logs(&self, logs: &[DeliveryLog]) -> Result<()>;

    async fn delivery_logs(&self, notification_id: Uuid) -> Result<Vec<DeliveryLog>>;

    async fn insert_user_notifications(&self, rows: &[UserNotification]) -> Result<()>;

    async fn user_notifications(&self, notification_id: Uuid) -> Result<Vec<UserNotification>>;

    /// Marks one row read and increments the notification's `read_count` atomically
    async fn mark_read(
        &self,
        notification_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReadOutcome>;

    /// Returns the number of rows newly marked read
    async fn mark_all_read(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<u64>;

    async fn unread_count(&self, user_id: Uuid) -> Result<u64>;

    async fn list_user_notifications(
        &self,
        user_id: Uuid,
        query: &UserNotificationQuery,
    ) -> Result<Page<UserNotificationView>>;

    async fn delivery_stats(
        &self,
        notification_id: Uuid,
    ) -> Result<BTreeMap<ChannelKind, ChannelDeliveryStats>>;

    async fn health_check(&self) -> Result<bool>;
}

/// Read-only view of users and student enrolments
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<Recipient>>;

    async fn active_users(&self, tenant_id: Uuid) -> Result<Vec<Recipient>>;

    async fn active_users_by_ids(&self, tenant_id: Uuid, ids: &[Uuid]) -> Result<Vec<Recipient>>;

    /// Role names compare case-insensitively
    async fn active_users_by_roles(
        &self,
        tenant_id: Uuid,
        roles: &[String],
    ) -> Result<Vec<Recipient>>;

    /// Accounts of ACTIVE students in the classes, plus their guardians
    async fn active_users_by_classes(
        &self,
        tenant_id: Uuid,
        class_ids: &[Uuid],
    ) -> Result<Vec<Recipient>>;
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get_preferences(&self, user_id: Uuid) -> Result<Option<UserNotificationPreferences>>;

    async fn get_preferences_many(
        &self,
        user_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, UserNotificationPreferences>>;

    async fn upsert_preferences(&self, preferences: &UserNotificationPreferences) -> Result<()>;
}
