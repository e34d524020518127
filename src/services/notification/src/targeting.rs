//! Expands a notification's targeting mode into eligible recipients

use crate::error::Result;
use crate::filter::PreferenceFilter;
use crate::preferences::PreferenceService;
use crate::store::DirectoryStore;
use chrono::{DateTime, Utc};
use edu_core_shared::types::{Notification, Recipient, TargetType, UserNotificationPreferences};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A recipient that passed the preference filter, with the record it was
/// judged against (`None` when the user has no stored preferences).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub recipient: Recipient,
    pub preferences: Option<UserNotificationPreferences>,
}

#[derive(Clone)]
pub struct TargetResolver {
    directory: Arc<dyn DirectoryStore>,
    preferences: PreferenceService,
    filter: PreferenceFilter,
}

impl TargetResolver {
    pub fn new(
        directory: Arc<dyn DirectoryStore>,
        preferences: PreferenceService,
        filter: PreferenceFilter,
    ) -> Self {
        Self {
            directory,
            preferences,
            filter,
        }
    }

    /// Active users selected by the targeting mode, one entry per user id.
    pub async fn expand(&self, notification: &Notification) -> Result<Vec<Recipient>> {
        let tenant = notification.tenant_id;
        let directory = &self.directory;

        let candidates = match notification.target_type {
            TargetType::AllUsers => directory.active_users(tenant).await?,
            TargetType::SpecificUsers => {
                by_ids(directory.as_ref(), tenant, &notification.target_user_ids).await?
            }
            TargetType::RoleBased => {
                by_roles(directory.as_ref(), tenant, &notification.target_roles).await?
            }
            TargetType::ClassBased => {
                by_classes(directory.as_ref(), tenant, &notification.target_class_ids).await?
            }
            TargetType::Combined => {
                let mut all =
                    by_ids(directory.as_ref(), tenant, &notification.target_user_ids).await?;
                all.extend(by_roles(directory.as_ref(), tenant, &notification.target_roles).await?);
                all.extend(
                    by_classes(directory.as_ref(), tenant, &notification.target_class_ids).await?,
                );
                all
            }
        };

        Ok(dedupe(candidates))
    }

    /// Expansion followed by preference filtering.
    pub async fn resolve(
        &self,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResolvedTarget>> {
        let candidates = self.expand(notification).await?;
        let ids: Vec<Uuid> = candidates.iter().map(|r| r.id).collect();
        let mut stored = self.preferences.load_many(&ids).await;

        let candidate_count = candidates.len();
        let targets: Vec<ResolvedTarget> = candidates
            .into_iter()
            .filter_map(|recipient| {
                let preferences = stored.remove(&recipient.id);
                self.filter
                    .is_eligible(preferences.as_ref(), notification, now)
                    .then_some(ResolvedTarget {
                        recipient,
                        preferences,
                    })
            })
            .collect();

        debug!(
            notification_id = %notification.id,
            target_type = %notification.target_type,
            candidates = candidate_count,
            eligible = targets.len(),
            "Targets resolved"
        );
        Ok(targets)
    }
}

async fn by_ids(directory: &dyn DirectoryStore, tenant: Uuid, ids: &[Uuid]) -> Result<Vec<Recipient>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    directory.active_users_by_ids(tenant, ids).await
}

async fn by_roles(
    directory: &dyn DirectoryStore,
    tenant: Uuid,
    roles: &[String],
) -> Result<Vec<Recipient>> {
    if roles.is_empty() {
        return Ok(Vec::new());
    }
    directory.active_users_by_roles(tenant, roles).await
}

async fn by_classes(
    directory: &dyn DirectoryStore,
    tenant: Uuid,
    class_ids: &[Uuid],
) -> Result<Vec<Recipient>> {
    if class_ids.is_empty() {
        return Ok(Vec::new());
    }
    directory.active_users_by_classes(tenant, class_ids).await
}

/// First occurrence wins; order is otherwise preserved.
fn dedupe(recipients: Vec<Recipient>) -> Vec<Recipient> {
    let mut seen = HashSet::with_capacity(recipients.len());
    recipients
        .into_iter()
        .filter(|r| seen.insert(r.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, PreferenceStore};
    use edu_core_shared::types::{
        NotificationStatus, Student, StudentStatus, SubmitNotificationRequest,
    };
    use serde_json::{json, Value};

    struct Fixture {
        store: Arc<MemoryStore>,
        resolver: TargetResolver,
        tenant: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let preferences = PreferenceService::new(store.clone(), store.clone());
        let resolver = TargetResolver::new(
            store.clone(),
            preferences,
            PreferenceFilter::new(chrono_tz::UTC),
        );
        Fixture {
            store,
            resolver,
            tenant: Uuid::new_v4(),
        }
    }

    impl Fixture {
        fn user(&self, role: &str) -> Recipient {
            let user = Recipient {
                id: Uuid::new_v4(),
                tenant_id: self.tenant,
                role: role.to_string(),
                display_name: None,
                email: None,
                phone: None,
                parent_phone: None,
                staff_phone: None,
                is_active: true,
            };
            self.store.insert_user(user.clone());
            user
        }

        fn notification(&self, targeting: Value) -> Notification {
            let mut body = json!({
                "tenant_id": self.tenant,
                "title": "Trip",
                "message": "Museum trip on Monday",
                "channels": ["IN_APP"]
            });
            if let (Some(body), Some(extra)) = (body.as_object_mut(), targeting.as_object()) {
                body.extend(extra.clone());
            }
            let request: SubmitNotificationRequest = serde_json::from_value(body).unwrap();
            Notification::from_request(request, NotificationStatus::Sending, Utc::now())
        }
    }

    #[tokio::test]
    async fn test_all_users_is_scoped_to_tenant_and_active() {
        let f = fixture();
        let teacher = f.user("TEACHER");
        let mut inactive = f.user("TEACHER");
        inactive.is_active = false;
        f.store.insert_user(inactive);
        f.store.insert_user(Recipient {
            tenant_id: Uuid::new_v4(),
            id: Uuid::new_v4(),
            ..teacher.clone()
        });

        let n = f.notification(json!({"target_type": "ALL_USERS"}));
        let ids: Vec<Uuid> = f.resolver.expand(&n).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![teacher.id]);
    }

    #[tokio::test]
    async fn test_roles_match_case_insensitively() {
        let f = fixture();
        let admin = f.user("School_Admin");
        f.user("STUDENT");

        let n = f.notification(json!({"target_type": "ROLE_BASED", "target_roles": ["SCHOOL_ADMIN"]}));
        let resolved = f.resolver.expand(&n).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, admin.id);
    }

    #[tokio::test]
    async fn test_combined_targets_are_a_union() {
        let f = fixture();
        let parent = f.user("PARENT");
        let pupil = f.user("STUDENT");
        let teacher = f.user("TEACHER");
        let class_id = Uuid::new_v4();
        f.store.insert_student(Student {
            id: Uuid::new_v4(),
            tenant_id: f.tenant,
            user_id: Some(pupil.id),
            class_id,
            status: StudentStatus::Active,
            guardian_user_ids: vec![parent.id],
        });

        // parent is reachable through all three paths
        let n = f.notification(json!({
            "target_type": "COMBINED",
            "target_user_ids": [parent.id, teacher.id],
            "target_roles": ["PARENT"],
            "target_class_ids": [class_id]
        }));
        let resolved = f.resolver.expand(&n).await.unwrap();
        let ids: HashSet<Uuid> = resolved.iter().map(|r| r.id).collect();

        assert_eq!(resolved.len(), 3);
        assert_eq!(ids, HashSet::from([parent.id, pupil.id, teacher.id]));
    }

    #[tokio::test]
    async fn test_resolve_applies_preference_filter() {
        let f = fixture();
        let opted_out = f.user("TEACHER");
        let no_record = f.user("TEACHER");

        let mut prefs =
            UserNotificationPreferences::defaults_for_role(opted_out.id, "TEACHER", Utc::now());
        prefs.is_enabled = false;
        f.store.upsert_preferences(&prefs).await.unwrap();

        let n = f.notification(json!({"target_type": "ALL_USERS"}));
        let targets = f.resolver.resolve(&n, Utc::now()).await.unwrap();

        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].recipient.id, no_record.id);
        assert!(targets[0].preferences.is_none());
    }
}
