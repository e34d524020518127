//! Per-user preference records
//!
//! Records are created lazily from role defaults the first time they are read.

use crate::error::{NotificationError, Result};
use crate::store::{DirectoryStore, PreferenceStore};
use chrono::{DateTime, Utc};
use edu_core_shared::types::preferences::parse_hhmm;
use edu_core_shared::types::{
    NotificationCategory, UpdatePreferencesRequest, UserNotificationPreferences,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct PreferenceService {
    preferences: Arc<dyn PreferenceStore>,
    directory: Arc<dyn DirectoryStore>,
}

impl PreferenceService {
    pub fn new(preferences: Arc<dyn PreferenceStore>, directory: Arc<dyn DirectoryStore>) -> Self {
        Self {
            preferences,
            directory,
        }
    }

    async fn role_defaults(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UserNotificationPreferences> {
        let user = self
            .directory
            .get_user(user_id)
            .await?
            .ok_or_else(|| NotificationError::not_found(format!("user {}", user_id)))?;
        Ok(UserNotificationPreferences::defaults_for_role(
            user_id, &user.role, now,
        ))
    }

    pub async fn get(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<UserNotificationPreferences> {
        if let Some(existing) = self.preferences.get_preferences(user_id).await? {
            return Ok(existing);
        }

        let defaults = self.role_defaults(user_id, now).await?;
        self.preferences.upsert_preferences(&defaults).await?;
        info!(user_id = %user_id, "Created default notification preferences");
        Ok(defaults)
    }

    /// Partial merge; fields absent from `update` keep their stored value.
    pub async fn update(
        &self,
        user_id: Uuid,
        update: &UpdatePreferencesRequest,
        now: DateTime<Utc>,
    ) -> Result<UserNotificationPreferences> {
        validate_update(update)?;

        let mut preferences = self.get(user_id, now).await?;
        preferences.apply_update(update, now);
        self.preferences.upsert_preferences(&preferences).await?;
        Ok(preferences)
    }

    pub async fn reset(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<UserNotificationPreferences> {
        let mut defaults = self.role_defaults(user_id, now).await?;
        if let Some(existing) = self.preferences.get_preferences(user_id).await? {
            defaults.created_at = existing.created_at;
        }
        self.preferences.upsert_preferences(&defaults).await?;
        info!(user_id = %user_id, "Reset notification preferences to role defaults");
        Ok(defaults)
    }

    /// Stored records for the given users. A read failure yields an empty map,
    /// which the filter treats as "no record" for everyone.
    pub async fn load_many(&self, user_ids: &[Uuid]) -> HashMap<Uuid, UserNotificationPreferences> {
        match self.preferences.get_preferences_many(user_ids).await {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    error = %e,
                    users = user_ids.len(),
                    "Preference lookup failed; treating recipients as fully opted in"
                );
                HashMap::new()
            }
        }
    }
}

pub fn validate_update(update: &UpdatePreferencesRequest) -> Result<()> {
    for (field, value) in [
        ("quiet_hours_start", &update.quiet_hours_start),
        ("quiet_hours_end", &update.quiet_hours_end),
    ] {
        if let Some(value) = value {
            if parse_hhmm(value).is_none() {
                return Err(NotificationError::validation(
                    field,
                    format!("'{}' is not a 24-hour HH:MM time", value),
                ));
            }
        }
    }

    if let Some(ref categories) = update.category_preferences {
        for category in categories.keys() {
            if category.parse::<NotificationCategory>().is_err() {
                return Err(NotificationError::validation(
                    "category_preferences",
                    format!("unknown category '{}'", category),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use edu_core_shared::types::{ChannelTogglesUpdate, QuietDay, Recipient};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn service_with_user(role: &str) -> (PreferenceService, Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        store.insert_user(Recipient {
            id: user_id,
            tenant_id: Uuid::new_v4(),
            role: role.to_string(),
            display_name: None,
            email: None,
            phone: None,
            parent_phone: None,
            staff_phone: None,
            is_active: true,
        });
        (
            PreferenceService::new(store.clone(), store.clone()),
            store,
            user_id,
        )
    }

    #[tokio::test]
    async fn test_lazy_defaults_follow_role() {
        let (service, store, user_id) = service_with_user("PARENT");
        let prefs = service.get(user_id, Utc::now()).await.unwrap();

        assert!(prefs.sms_enabled);
        assert!(!prefs.quiet_hours_enabled);
        assert!(store.get_preferences(user_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let (service, _, _) = service_with_user("TEACHER");
        let err = service.get(Uuid::new_v4(), Utc::now()).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_is_a_partial_merge() {
        let (service, _, user_id) = service_with_user("TEACHER");
        let now = Utc::now();
        service
            .update(
                user_id,
                &UpdatePreferencesRequest {
                    quiet_hours_enabled: Some(true),
                    quiet_hours_days: Some(vec![QuietDay::Sat, QuietDay::Sun]),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();

        let updated = service
            .update(
                user_id,
                &UpdatePreferencesRequest {
                    sms_enabled: Some(true),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();

        assert!(updated.sms_enabled);
        assert!(updated.quiet_hours_enabled);
        assert_eq!(updated.quiet_hours_days, vec![QuietDay::Sat, QuietDay::Sun]);
        assert_eq!(service.get(user_id, now).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_invalid_times_are_rejected_before_persisting() {
        let (service, store, user_id) = service_with_user("TEACHER");
        let err = service
            .update(
                user_id,
                &UpdatePreferencesRequest {
                    quiet_hours_start: Some("24:00".to_string()),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
        assert!(store.get_preferences(user_id).await.unwrap().is_none());
    }

    #[test]
    fn test_unknown_category_key_is_rejected() {
        let mut types = BTreeMap::new();
        types.insert("GRADE_UPDATE".to_string(), ChannelTogglesUpdate::default());
        let mut categories = BTreeMap::new();
        categories.insert("HOMEWORK".to_string(), types);

        let update = UpdatePreferencesRequest {
            category_preferences: Some(categories),
            ..Default::default()
        };
        assert!(validate_update(&update).is_err());
    }

    #[tokio::test]
    async fn test_reset_restores_defaults_and_keeps_created_at() {
        let (service, _, user_id) = service_with_user("STUDENT");
        let first = Utc::now() - chrono::Duration::days(10);
        service.get(user_id, first).await.unwrap();
        service
            .update(
                user_id,
                &UpdatePreferencesRequest {
                    is_enabled: Some(false),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let reset = service.reset(user_id, Utc::now()).await.unwrap();
        assert!(reset.is_enabled);
        assert!(reset.quiet_hours_enabled);
        assert_eq!(reset.quiet_hours_start, "21:00");
        assert_eq!(reset.created_at, first);
    }
}
