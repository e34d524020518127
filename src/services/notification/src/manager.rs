//! Notification Manager
//!
//! Owns the notification lifecycle and coordinates the dispatch pipeline:
//! - validation and persistence of submissions
//! - deferral of scheduled sends to the job queue
//! - target resolution and preference filtering
//! - batched per-channel delivery and tracking
//! - final status aggregation
//!
//! ```text
//! PENDING ──▶ SENDING ──▶ SENT | PARTIALLY_SENT | FAILED
//!    └──▶ SCHEDULED ──▶ SENDING ──▶ ...
//!              └──▶ CANCELLED
//! ```

use crate::channels::ChannelRegistry;
use crate::config::NotificationConfig;
use crate::dispatch::ChannelDispatcher;
use crate::error::{NotificationError, Result};
use crate::filter::PreferenceFilter;
use crate::metrics::NotificationMetrics;
use crate::preferences::PreferenceService;
use crate::queue::{EnqueueOptions, Job, JobProcessor, JobQueue, PROCESS_NOTIFICATION};
use crate::store::{
    DirectoryStore, DispatchOutcome, NotificationStore, PreferenceStore, ReadOutcome,
};
use crate::targeting::TargetResolver;
use crate::templates::{render_context, RenderedContent, TemplateRenderer};
use crate::tracker::DeliveryTracker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edu_core_shared::types::{
    ChannelKind, DeliveryLog, DeliveryStats, Notification, NotificationStatus, Page,
    ProcessSummary, Recipient, RecipientOutcome, SubmitNotificationRequest,
    SubmitNotificationResponse, TargetType, UpdatePreferencesRequest, UserNotification,
    UserNotificationPreferences, UserNotificationQuery, UserNotificationView,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

/// Collaborators injected into the manager
pub struct ManagerComponents {
    pub notifications: Arc<dyn NotificationStore>,
    pub directory: Arc<dyn DirectoryStore>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub queue: Arc<dyn JobQueue>,
    pub channels: ChannelRegistry,
    pub renderer: Option<Arc<dyn TemplateRenderer>>,
    pub metrics: Option<NotificationMetrics>,
}

/// A notification with its audit trail and per-user tracking rows
#[derive(Debug, Clone, Serialize)]
pub struct NotificationDetails {
    #[serde(flatten)]
    pub notification: Notification,
    pub delivery_logs: Vec<DeliveryLog>,
    pub recipients: Vec<UserNotification>,
}

#[derive(Clone)]
pub struct NotificationManager {
    store: Arc<dyn NotificationStore>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<ChannelRegistry>,
    renderer: Option<Arc<dyn TemplateRenderer>>,
    preferences: PreferenceService,
    resolver: TargetResolver,
    tracker: DeliveryTracker,
    dispatcher: ChannelDispatcher,
    queue_options: EnqueueOptions,
    metrics: Option<NotificationMetrics>,
}

impl NotificationManager {
    pub fn new(components: ManagerComponents, config: &NotificationConfig) -> Self {
        let ManagerComponents {
            notifications,
            directory,
            preferences,
            queue,
            channels,
            renderer,
            metrics,
        } = components;

        let preference_service = PreferenceService::new(preferences, directory.clone());
        let resolver = TargetResolver::new(
            directory,
            preference_service.clone(),
            PreferenceFilter::new(config.timezone()),
        );
        let tracker = DeliveryTracker::new(notifications.clone());
        let mut dispatcher = ChannelDispatcher::new(tracker.clone(), config.dispatch.batch_size);
        if let Some(ref metrics) = metrics {
            dispatcher = dispatcher.with_metrics(metrics.clone());
        }

        Self {
            store: notifications,
            queue,
            registry: Arc::new(channels),
            renderer,
            preferences: preference_service,
            resolver,
            tracker,
            dispatcher,
            queue_options: EnqueueOptions::from_config(&config.queue),
            metrics,
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    pub async fn submit(
        &self,
        request: SubmitNotificationRequest,
    ) -> Result<SubmitNotificationResponse> {
        self.submit_at(request, Utc::now()).await
    }

    /// Persists the request, then either defers it to the queue (future
    /// `scheduled_at`) or processes it straight away.
    pub async fn submit_at(
        &self,
        request: SubmitNotificationRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitNotificationResponse> {
        self.validate_submission(&request, now)?;

        let scheduled_at = request.scheduled_at.filter(|at| *at > now);
        let status = if scheduled_at.is_some() {
            NotificationStatus::Scheduled
        } else {
            NotificationStatus::Pending
        };

        let notification = Notification::from_request(request, status, now);
        self.store.insert_notification(&notification).await?;
        info!(
            notification_id = %notification.id,
            tenant_id = %notification.tenant_id,
            status = %status,
            channels = ?notification.channels,
            "Notification accepted"
        );

        if let Some(at) = scheduled_at {
            let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
            self.schedule(&notification, delay, now).await?;
            return Ok(SubmitNotificationResponse {
                notification_id: notification.id,
                status,
                summary: None,
            });
        }

        let summary = self.process_at(notification.id, now).await?;
        Ok(SubmitNotificationResponse {
            notification_id: notification.id,
            status: summary.status,
            summary: Some(summary),
        })
    }

    async fn schedule(
        &self,
        notification: &Notification,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let options = self.queue_options.clone().with_delay(delay);
        let payload = json!({ "notification_id": notification.id });

        match self.queue.enqueue(PROCESS_NOTIFICATION, payload, options).await {
            Ok(job) => {
                info!(
                    notification_id = %notification.id,
                    job_id = %job.id,
                    run_at = %job.run_at,
                    "Notification scheduled"
                );
                Ok(())
            }
            Err(e) => {
                error!(notification_id = %notification.id, error = %e, "Failed to enqueue scheduled notification");
                self.store
                    .mark_failed(notification.id, &e.to_string(), now)
                    .await?;
                Err(e)
            }
        }
    }

    fn validate_submission(
        &self,
        request: &SubmitNotificationRequest,
        now: DateTime<Utc>,
    ) -> Result<()> {
        request.validate()?;

        if let Some(channel) = request
            .channels
            .iter()
            .find(|c| !self.registry.is_registered(**c))
        {
            return Err(NotificationError::validation(
                "channels",
                format!("channel {} is not available", channel),
            ));
        }

        if request.target_roles.iter().any(|r| r.trim().is_empty()) {
            return Err(NotificationError::validation(
                "target_roles",
                "role names cannot be blank",
            ));
        }

        let (field, present) = match request.target_type {
            TargetType::AllUsers => ("", true),
            TargetType::SpecificUsers => ("target_user_ids", !request.target_user_ids.is_empty()),
            TargetType::RoleBased => ("target_roles", !request.target_roles.is_empty()),
            TargetType::ClassBased => ("target_class_ids", !request.target_class_ids.is_empty()),
            TargetType::Combined => (
                "targets",
                !request.target_user_ids.is_empty()
                    || !request.target_roles.is_empty()
                    || !request.target_class_ids.is_empty(),
            ),
        };
        if !present {
            return Err(NotificationError::validation(
                field,
                format!("{} targeting requires at least one target", request.target_type),
            ));
        }

        if let Some(expires_at) = request.expires_at {
            if expires_at <= now {
                return Err(NotificationError::validation(
                    "expires_at",
                    "must be in the future",
                ));
            }
            if request.scheduled_at.is_some_and(|at| expires_at <= at) {
                return Err(NotificationError::validation(
                    "expires_at",
                    "must be after scheduled_at",
                ));
            }
        }

        Ok(())
    }

    // =========================================================================
    // Processing
    // =========================================================================

    pub async fn process(&self, id: Uuid) -> Result<ProcessSummary> {
        self.process_at(id, Utc::now()).await
    }

    /// Claims the notification (PENDING/SCHEDULED -> SENDING) and runs the
    /// pipeline. Any pipeline error leaves the notification FAILED and is
    /// returned to the caller.
    ///
    /// Once claimed, the pipeline runs on its own task so a caller that goes
    /// away (request timeout, client disconnect) cannot strand the
    /// notification in SENDING.
    pub async fn process_at(&self, id: Uuid, now: DateTime<Utc>) -> Result<ProcessSummary> {
        let claimed = self
            .store
            .transition_status(
                id,
                &[NotificationStatus::Pending, NotificationStatus::Scheduled],
                NotificationStatus::Sending,
                now,
            )
            .await?;
        if !claimed {
            return match self.store.get_notification(id).await? {
                Some(existing) => Err(NotificationError::not_processable(id, existing.status)),
                None => Err(NotificationError::not_found(format!("notification {}", id))),
            };
        }
        info!(notification_id = %id, status = %NotificationStatus::Sending, "Dispatch started");

        let manager = self.clone();
        let dispatch = tokio::spawn(async move { manager.dispatch_claimed(id, now).await });
        match dispatch.await {
            Ok(result) => result,
            Err(join_err) => {
                let e = NotificationError::internal(format!("Dispatch task aborted: {}", join_err));
                self.fail_claimed(id, &e).await;
                Err(e)
            }
        }
    }

    async fn dispatch_claimed(&self, id: Uuid, now: DateTime<Utc>) -> Result<ProcessSummary> {
        let _timer = self.metrics.as_ref().map(|m| m.start_timer());
        match self.run_pipeline(id, now).await {
            Ok(summary) => {
                info!(
                    notification_id = %id,
                    status = %summary.status,
                    targets = summary.targets_count,
                    succeeded = summary.success_count,
                    failed = summary.failure_count,
                    "Dispatch finished"
                );
                self.record_processed(summary.status);
                Ok(summary)
            }
            Err(e) => {
                self.fail_claimed(id, &e).await;
                Err(e)
            }
        }
    }

    async fn fail_claimed(&self, id: Uuid, e: &NotificationError) {
        error!(notification_id = %id, error = %e, "Dispatch pipeline failed");
        if let Err(mark_err) = self.store.mark_failed(id, &e.to_string(), Utc::now()).await {
            error!(notification_id = %id, error = %mark_err, "Failed to record FAILED status");
        }
        self.record_processed(NotificationStatus::Failed);
    }

    async fn run_pipeline(&self, id: Uuid, now: DateTime<Utc>) -> Result<ProcessSummary> {
        let notification = self
            .store
            .get_notification(id)
            .await?
            .ok_or_else(|| NotificationError::not_found(format!("notification {}", id)))?;

        if notification.is_expired_at(now) {
            return Err(NotificationError::Expired { id });
        }

        let targets = self.resolver.resolve(&notification, now).await?;
        if targets.is_empty() {
            info!(notification_id = %id, "No eligible targets");
            let outcome = DispatchOutcome {
                status: NotificationStatus::Sent,
                total_targets: 0,
                delivered_at: None,
            };
            self.store.complete_notification(id, &outcome, Utc::now()).await?;
            return Ok(ProcessSummary::empty(id));
        }

        let content = self.render(&notification).await?;

        let mut results: BTreeMap<ChannelKind, Vec<RecipientOutcome>> = BTreeMap::new();
        let (mut success_count, mut failure_count) = (0u64, 0u64);

        for &channel in &notification.channels {
            if !self.registry.is_enabled(channel) {
                warn!(notification_id = %id, channel = %channel, "Channel disabled; skipping");
                continue;
            }
            let Some(adapter) = self.registry.get(channel) else {
                warn!(notification_id = %id, channel = %channel, "No adapter registered; skipping");
                continue;
            };

            let recipients: Vec<&Recipient> = targets
                .iter()
                .filter(|t| {
                    PreferenceFilter::allows_channel(t.preferences.as_ref(), &notification, channel)
                })
                .map(|t| &t.recipient)
                .collect();
            if recipients.is_empty() {
                continue;
            }

            let outcomes = self
                .dispatcher
                .dispatch(&adapter, &notification, &content, &recipients)
                .await?;
            let delivered = outcomes.iter().filter(|o| o.success).count() as u64;
            success_count += delivered;
            failure_count += outcomes.len() as u64 - delivered;
            results.insert(channel, outcomes);
        }

        let user_ids: Vec<Uuid> = targets.iter().map(|t| t.recipient.id).collect();
        let finished_at = Utc::now();
        self.tracker
            .record_recipients(id, &user_ids, &results, finished_at)
            .await?;

        let status = NotificationStatus::from_outcome(success_count, failure_count);
        let outcome = DispatchOutcome {
            status,
            total_targets: user_ids.len() as i64,
            delivered_at: (success_count > 0).then_some(finished_at),
        };
        self.store
            .complete_notification(id, &outcome, finished_at)
            .await?;

        Ok(ProcessSummary {
            notification_id: id,
            status,
            targets_count: user_ids.len() as u64,
            success_count,
            failure_count,
            results,
        })
    }

    async fn render(&self, notification: &Notification) -> Result<RenderedContent> {
        match (&notification.template_id, &self.renderer) {
            (Some(template_id), Some(renderer)) => {
                renderer
                    .render(template_id, &render_context(notification))
                    .await
            }
            (Some(template_id), None) => {
                warn!(
                    notification_id = %notification.id,
                    template_id = %template_id,
                    "No template renderer configured; sending raw content"
                );
                Ok(RenderedContent::raw(notification))
            }
            (None, _) => Ok(RenderedContent::raw(notification)),
        }
    }

    fn record_processed(&self, status: NotificationStatus) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_processed(status);
        }
    }

    // =========================================================================
    // Queries and lifecycle
    // =========================================================================

    async fn load(&self, id: Uuid, tenant_id: Option<Uuid>) -> Result<Notification> {
        self.store
            .get_notification(id)
            .await?
            .filter(|n| tenant_id.map_or(true, |tenant| n.tenant_id == tenant))
            .ok_or_else(|| NotificationError::not_found(format!("notification {}", id)))
    }

    pub async fn get_notification(
        &self,
        id: Uuid,
        tenant_id: Option<Uuid>,
    ) -> Result<NotificationDetails> {
        let notification = self.load(id, tenant_id).await?;
        let delivery_logs = self.store.delivery_logs(id).await?;
        let recipients = self.store.user_notifications(id).await?;
        Ok(NotificationDetails {
            notification,
            delivery_logs,
            recipients,
        })
    }

    /// Only a SCHEDULED notification can be cancelled. Losing the race against
    /// the scheduled job changes nothing and reports a conflict.
    pub async fn cancel(&self, id: Uuid, tenant_id: Option<Uuid>) -> Result<Notification> {
        let notification = self.load(id, tenant_id).await?;
        let now = Utc::now();

        let cancelled = self
            .store
            .transition_status(
                id,
                &[NotificationStatus::Scheduled],
                NotificationStatus::Cancelled,
                now,
            )
            .await?;
        if !cancelled {
            let current = self
                .store
                .get_notification(id)
                .await?
                .map_or(notification.status, |n| n.status);
            return Err(NotificationError::conflict(format!(
                "notification {} is {} and can no longer be cancelled",
                id, current
            )));
        }

        info!(notification_id = %id, status = %NotificationStatus::Cancelled, "Notification cancelled");
        self.load(id, tenant_id).await
    }

    pub async fn mark_as_read(&self, notification_id: Uuid, user_id: Uuid) -> Result<ReadOutcome> {
        self.tracker
            .mark_read(notification_id, user_id, Utc::now())
            .await
    }

    pub async fn mark_all_as_read(&self, user_id: Uuid) -> Result<u64> {
        let marked = self.tracker.mark_all_read(user_id, Utc::now()).await?;
        info!(user_id = %user_id, marked, "Marked all notifications read");
        Ok(marked)
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<u64> {
        self.tracker.unread_count(user_id).await
    }

    pub async fn list_user_notifications(
        &self,
        user_id: Uuid,
        query: &UserNotificationQuery,
    ) -> Result<Page<UserNotificationView>> {
        self.tracker.list(user_id, query).await
    }

    pub async fn delivery_stats(&self, id: Uuid, tenant_id: Option<Uuid>) -> Result<DeliveryStats> {
        let notification = self.load(id, tenant_id).await?;
        self.tracker.stats(&notification).await
    }

    // =========================================================================
    // Preferences
    // =========================================================================

    pub async fn get_user_preferences(&self, user_id: Uuid) -> Result<UserNotificationPreferences> {
        self.preferences.get(user_id, Utc::now()).await
    }

    pub async fn update_user_preferences(
        &self,
        user_id: Uuid,
        update: &UpdatePreferencesRequest,
    ) -> Result<UserNotificationPreferences> {
        self.preferences.update(user_id, update, Utc::now()).await
    }

    pub async fn reset_user_preferences(&self, user_id: Uuid) -> Result<UserNotificationPreferences> {
        self.preferences.reset(user_id, Utc::now()).await
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub async fn health_check(&self) -> Value {
        let store_healthy = self.store.health_check().await.unwrap_or(false);
        let queue_healthy = self.queue.health_check().await.unwrap_or(false);
        let queue_depth = match self.queue.len().await {
            Ok(depth) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.set_queue_depth(depth);
                }
                Some(depth)
            }
            Err(e) => {
                warn!(error = %e, "Failed to read queue depth");
                None
            }
        };

        let channels: BTreeMap<String, Value> = self
            .registry
            .health_check_all()
            .await
            .into_iter()
            .map(|(kind, healthy)| {
                (
                    kind.to_string(),
                    json!({
                        "healthy": healthy,
                        "enabled": self.registry.is_enabled(kind),
                    }),
                )
            })
            .collect();

        let status = if store_healthy && queue_healthy {
            "healthy"
        } else {
            "degraded"
        };

        json!({
            "status": status,
            "timestamp": Utc::now(),
            "store": { "healthy": store_healthy },
            "queue": { "healthy": queue_healthy, "depth": queue_depth },
            "channels": channels,
        })
    }
}

#[async_trait]
impl JobProcessor for NotificationManager {
    async fn handle(&self, job: &Job) -> Result<()> {
        match job.job_type.as_str() {
            PROCESS_NOTIFICATION => {
                let id = job.notification_id().ok_or_else(|| {
                    NotificationError::validation("notification_id", "missing from job payload")
                })?;
                self.process(id).await.map(|_| ())
            }
            other => Err(NotificationError::validation(
                "job_type",
                format!("unknown job type '{}'", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::InAppChannel;
    use crate::queue::MemoryJobQueue;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Harness {
        manager: NotificationManager,
        store: Arc<MemoryStore>,
        queue: Arc<MemoryJobQueue>,
        tenant: Uuid,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::default());
        let mut channels = ChannelRegistry::new();
        channels.register(Arc::new(InAppChannel::with_capacity(8)));

        let manager = NotificationManager::new(
            ManagerComponents {
                notifications: store.clone(),
                directory: store.clone(),
                preferences: store.clone(),
                queue: queue.clone(),
                channels,
                renderer: None,
                metrics: None,
            },
            &NotificationConfig::default(),
        );
        Harness {
            manager,
            store,
            queue,
            tenant: Uuid::new_v4(),
        }
    }

    fn request(tenant: Uuid, extra: Value) -> SubmitNotificationRequest {
        let mut body = json!({
            "tenant_id": tenant,
            "title": "Parents evening",
            "message": "Thursday 18:00 in the main hall",
            "channels": ["IN_APP"],
            "target_type": "ALL_USERS"
        });
        if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            body.extend(extra.clone());
        }
        serde_json::from_value(body).unwrap()
    }

    #[tokio::test]
    async fn test_targeting_lists_are_required() {
        let h = harness();
        let err = h
            .manager
            .submit(request(h.tenant, json!({"target_type": "ROLE_BASED"})))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Validation { ref field, .. } if field == "target_roles"));

        let err = h
            .manager
            .submit(request(h.tenant, json!({"target_type": "COMBINED"})))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_unregistered_channel_is_rejected_without_persisting() {
        let h = harness();
        let err = h
            .manager
            .submit(request(h.tenant, json!({"channels": ["SMS"]})))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Validation { ref field, .. } if field == "channels"));
        assert_eq!(h.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expiry_must_follow_schedule() {
        let h = harness();
        let now = Utc::now();
        let err = h
            .manager
            .submit_at(
                request(
                    h.tenant,
                    json!({
                        "scheduled_at": now + chrono::Duration::hours(2),
                        "expires_at": now + chrono::Duration::hours(1)
                    }),
                ),
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Validation { ref field, .. } if field == "expires_at"));
    }

    #[tokio::test]
    async fn test_expired_notification_fails_on_process() {
        let h = harness();
        let now = Utc::now();
        let response = h
            .manager
            .submit_at(
                request(
                    h.tenant,
                    json!({
                        "scheduled_at": now + chrono::Duration::minutes(5),
                        "expires_at": now + chrono::Duration::minutes(10)
                    }),
                ),
                now,
            )
            .await
            .unwrap();

        let late = now + chrono::Duration::minutes(20);
        let err = h
            .manager
            .process_at(response.notification_id, late)
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Expired { .. }));

        let stored = h
            .store
            .get_notification(response.notification_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert!(stored.error_message.is_some());
    }

    #[tokio::test]
    async fn test_tenant_mismatch_is_not_found() {
        let h = harness();
        let response = h.manager.submit(request(h.tenant, json!({}))).await.unwrap();
        let err = h
            .manager
            .get_notification(response.notification_id, Some(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_job_type_is_not_retryable() {
        let h = harness();
        let job = Job::new("reindex", json!({}), &EnqueueOptions::default(), Utc::now());
        let err = h.manager.handle(&job).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
