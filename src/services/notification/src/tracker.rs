//! Delivery tracking: audit log rows, per-user inbox rows and read state

use crate::error::{NotificationError, Result};
use crate::store::{NotificationStore, ReadOutcome};
use chrono::{DateTime, Utc};
use edu_core_shared::types::{
    ChannelKind, DeliveryLog, DeliveryStats, Notification, Page, RecipientOutcome,
    UserNotification, UserNotificationQuery, UserNotificationView,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct DeliveryTracker {
    store: Arc<dyn NotificationStore>,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    pub async fn record_attempts(&self, logs: &[DeliveryLog]) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }
        self.store.append_delivery_logs(logs).await
    }

    /// Writes one inbox row per targeted user and returns them.
    pub async fn record_recipients(
        &self,
        notification_id: Uuid,
        user_ids: &[Uuid],
        results: &BTreeMap<ChannelKind, Vec<RecipientOutcome>>,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserNotification>> {
        let rows = build_user_notifications(notification_id, user_ids, results, now);
        self.store.insert_user_notifications(&rows).await?;
        debug!(notification_id = %notification_id, rows = rows.len(), "Inbox rows written");
        Ok(rows)
    }

    pub async fn mark_read(
        &self,
        notification_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReadOutcome> {
        match self.store.mark_read(notification_id, user_id, now).await? {
            ReadOutcome::NotFound => Err(NotificationError::not_found(format!(
                "notification {} for user {}",
                notification_id, user_id
            ))),
            outcome => Ok(outcome),
        }
    }

    pub async fn mark_all_read(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        self.store.mark_all_read(user_id, now).await
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<u64> {
        self.store.unread_count(user_id).await
    }

    pub async fn list(
        &self,
        user_id: Uuid,
        query: &UserNotificationQuery,
    ) -> Result<Page<UserNotificationView>> {
        self.store.list_user_notifications(user_id, query).await
    }

    pub async fn stats(&self, notification: &Notification) -> Result<DeliveryStats> {
        Ok(DeliveryStats {
            notification_id: notification.id,
            total_targets: notification.total_targets,
            read_count: notification.read_count,
            channels: self.store.delivery_stats(notification.id).await?,
        })
    }
}

/// `is_delivered` is true when at least one channel succeeded for the user;
/// `channel_data` carries that user's outcome per channel.
pub fn build_user_notifications(
    notification_id: Uuid,
    user_ids: &[Uuid],
    results: &BTreeMap<ChannelKind, Vec<RecipientOutcome>>,
    now: DateTime<Utc>,
) -> Vec<UserNotification> {
    let mut per_user: BTreeMap<Uuid, BTreeMap<ChannelKind, RecipientOutcome>> = BTreeMap::new();
    for (channel, outcomes) in results {
        for outcome in outcomes {
            per_user
                .entry(outcome.user_id)
                .or_default()
                .insert(*channel, outcome.clone());
        }
    }

    user_ids
        .iter()
        .map(|user_id| {
            let channel_data = per_user.remove(user_id).unwrap_or_default();
            let is_delivered = channel_data.values().any(|o| o.success);
            UserNotification {
                id: Uuid::new_v4(),
                user_id: *user_id,
                notification_id,
                is_delivered,
                delivered_at: is_delivered.then_some(now),
                is_read: false,
                read_at: None,
                channel_data,
                created_at: now,
            }
        })
        .collect()
}
