//! In-process store used by tests and when no database is configured

use super::{
    DirectoryStore, DispatchOutcome, NotificationStore, PreferenceStore, ReadOutcome,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edu_core_shared::types::{
    ChannelDeliveryStats, ChannelKind, DeliveryLog, DeliveryStatus, Notification,
    NotificationStatus, Page, PaginationInfo, Recipient, Student, StudentStatus,
    UserNotification, UserNotificationPreferences, UserNotificationQuery, UserNotificationView,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    notifications: HashMap<Uuid, Notification>,
    delivery_logs: Vec<DeliveryLog>,
    user_notifications: Vec<UserNotification>,
    users: HashMap<Uuid, Recipient>,
    students: Vec<Student>,
    preferences: HashMap<Uuid, UserNotificationPreferences>,
}

/// Implements every store trait over a single lock
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: Recipient) {
        self.inner.write().users.insert(user.id, user);
    }

    pub fn insert_student(&self, student: Student) {
        self.inner.write().students.push(student);
    }

    fn active_matching<F>(&self, tenant_id: Uuid, predicate: F) -> Vec<Recipient>
    where
        F: Fn(&Recipient) -> bool,
    {
        let inner = self.inner.read();
        let mut users: Vec<Recipient> = inner
            .users
            .values()
            .filter(|u| u.tenant_id == tenant_id && u.is_active && predicate(u))
            .cloned()
            .collect();
        users.sort_by_key(|u| u.id);
        users
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        self.inner
            .write()
            .notifications
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self.inner.read().notifications.get(&id).cloned())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: &[NotificationStatus],
        to: NotificationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.notifications.get_mut(&id) {
            Some(notification) if from.contains(&notification.status) => {
                notification.status = to;
                notification.updated_at = now;
                if to == NotificationStatus::Sending {
                    notification.sent_at = Some(now);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_notification(
        &self,
        id: Uuid,
        outcome: &DispatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(notification) = self.inner.write().notifications.get_mut(&id) {
            notification.status = outcome.status;
            notification.total_targets = outcome.total_targets;
            notification.delivered_at = outcome.delivered_at;
            notification.error_message = None;
            notification.updated_at = now;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(notification) = self.inner.write().notifications.get_mut(&id) {
            notification.status = NotificationStatus::Failed;
            notification.error_message = Some(error.to_string());
            notification.updated_at = now;
        }
        Ok(())
    }

    async fn append_delivery_logs(&self, logs: &[DeliveryLog]) -> Result<()> {
        self.inner.write().delivery_logs.extend_from_slice(logs);
        Ok(())
    }

    async fn delivery_logs(&self, notification_id: Uuid) -> Result<Vec<DeliveryLog>> {
        Ok(self
            .inner
            .read()
            .delivery_logs
            .iter()
            .filter(|log| log.notification_id == notification_id)
            .cloned()
            .collect())
    }

    async fn insert_user_notifications(&self, rows: &[UserNotification]) -> Result<()> {
        let mut inner = self.inner.write();
        for row in rows {
            let exists = inner
                .user_notifications
                .iter()
                .any(|r| r.notification_id == row.notification_id && r.user_id == row.user_id);
            if !exists {
                inner.user_notifications.push(row.clone());
            }
        }
        Ok(())
    }

    async fn user_notifications(&self, notification_id: Uuid) -> Result<Vec<UserNotification>> {
        Ok(self
            .inner
            .read()
            .user_notifications
            .iter()
            .filter(|row| row.notification_id == notification_id)
            .cloned()
            .collect())
    }

    async fn mark_read(
        &self,
        notification_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReadOutcome> {
        let mut inner = self.inner.write();
        let Some(row) = inner
            .user_notifications
            .iter_mut()
            .find(|r| r.notification_id == notification_id && r.user_id == user_id)
        else {
            return Ok(ReadOutcome::NotFound);
        };
        if row.is_read {
            return Ok(ReadOutcome::AlreadyRead);
        }
        row.is_read = true;
        row.read_at = Some(now);
        if let Some(notification) = inner.notifications.get_mut(&notification_id) {
            notification.read_count += 1;
        }
        Ok(ReadOutcome::Marked)
    }

    async fn mark_all_read(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut marked = Vec::new();
        for row in inner
            .user_notifications
            .iter_mut()
            .filter(|r| r.user_id == user_id && !r.is_read)
        {
            row.is_read = true;
            row.read_at = Some(now);
            marked.push(row.notification_id);
        }
        for notification_id in &marked {
            if let Some(notification) = inner.notifications.get_mut(notification_id) {
                notification.read_count += 1;
            }
        }
        Ok(marked.len() as u64)
    }

    async fn unread_count(&self, user_id: Uuid) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .user_notifications
            .iter()
            .filter(|r| r.user_id == user_id && !r.is_read)
            .count() as u64)
    }

    async fn list_user_notifications(
        &self,
        user_id: Uuid,
        query: &UserNotificationQuery,
    ) -> Result<Page<UserNotificationView>> {
        let inner = self.inner.read();
        let mut views: Vec<UserNotificationView> = inner
            .user_notifications
            .iter()
            .filter(|row| row.user_id == user_id && (!query.unread_only || !row.is_read))
            .filter_map(|row| {
                let notification = inner.notifications.get(&row.notification_id)?;
                if let Some(ref wanted) = query.notification_type {
                    if &notification.notification_type != wanted {
                        return None;
                    }
                }
                if query.category.is_some_and(|c| c != notification.category) {
                    return None;
                }
                Some(UserNotificationView {
                    id: row.id,
                    notification_id: notification.id,
                    title: notification.title.clone(),
                    message: notification.message.clone(),
                    notification_type: notification.notification_type.clone(),
                    category: notification.category,
                    priority: notification.priority,
                    is_delivered: row.is_delivered,
                    delivered_at: row.delivered_at,
                    is_read: row.is_read,
                    read_at: row.read_at,
                    created_at: row.created_at,
                })
            })
            .collect();
        views.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let (page, limit) = query.normalized();
        let total = views.len() as u64;
        let items = views
            .into_iter()
            .skip(query.offset() as usize)
            .take(limit as usize)
            .collect();

        Ok(Page {
            items,
            pagination: PaginationInfo::new(page, limit, total),
        })
    }

    async fn delivery_stats(
        &self,
        notification_id: Uuid,
    ) -> Result<BTreeMap<ChannelKind, ChannelDeliveryStats>> {
        let mut stats: BTreeMap<ChannelKind, ChannelDeliveryStats> = BTreeMap::new();
        for log in self
            .inner
            .read()
            .delivery_logs
            .iter()
            .filter(|log| log.notification_id == notification_id)
        {
            let entry = stats.entry(log.channel).or_default();
            match log.status {
                DeliveryStatus::Delivered => entry.delivered += 1,
                DeliveryStatus::Failed => entry.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<Recipient>> {
        Ok(self.inner.read().users.get(&user_id).cloned())
    }

    async fn active_users(&self, tenant_id: Uuid) -> Result<Vec<Recipient>> {
        Ok(self.active_matching(tenant_id, |_| true))
    }

    async fn active_users_by_ids(&self, tenant_id: Uuid, ids: &[Uuid]) -> Result<Vec<Recipient>> {
        Ok(self.active_matching(tenant_id, |u| ids.contains(&u.id)))
    }

    async fn active_users_by_roles(
        &self,
        tenant_id: Uuid,
        roles: &[String],
    ) -> Result<Vec<Recipient>> {
        Ok(self.active_matching(tenant_id, |u| {
            roles.iter().any(|role| role.eq_ignore_ascii_case(&u.role))
        }))
    }

    async fn active_users_by_classes(
        &self,
        tenant_id: Uuid,
        class_ids: &[Uuid],
    ) -> Result<Vec<Recipient>> {
        let linked: BTreeSet<Uuid> = self
            .inner
            .read()
            .students
            .iter()
            .filter(|s| {
                s.tenant_id == tenant_id
                    && s.status == StudentStatus::Active
                    && class_ids.contains(&s.class_id)
            })
            .flat_map(|s| s.user_id.into_iter().chain(s.guardian_user_ids.iter().copied()))
            .collect();
        Ok(self.active_matching(tenant_id, |u| linked.contains(&u.id)))
    }
}

#[async_trait]
impl PreferenceStore for MemoryStore {
    async fn get_preferences(&self, user_id: Uuid) -> Result<Option<UserNotificationPreferences>> {
        Ok(self.inner.read().preferences.get(&user_id).cloned())
    }

    async fn get_preferences_many(
        &self,
        user_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, UserNotificationPreferences>> {
        let inner = self.inner.read();
        Ok(user_ids
            .iter()
            .filter_map(|id| inner.preferences.get(id).map(|p| (*id, p.clone())))
            .collect())
    }

    async fn upsert_preferences(&self, preferences: &UserNotificationPreferences) -> Result<()> {
        let mut inner = self.inner.write();
        let created_at = inner
            .preferences
            .get(&preferences.user_id)
            .map(|existing| existing.created_at)
            .unwrap_or(preferences.created_at);
        let mut stored = preferences.clone();
        stored.created_at = created_at;
        inner.preferences.insert(stored.user_id, stored);
        Ok(())
    }
}
