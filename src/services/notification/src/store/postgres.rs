//! PostgreSQL store

use super::{
    DirectoryStore, DispatchOutcome, NotificationStore, PreferenceStore, ReadOutcome,
};
use crate::config::DatabaseConfig;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edu_core_shared::types::{
    ChannelDeliveryStats, ChannelKind, ChannelToggles, DeliveryLog, DeliveryStatus, Notification,
    NotificationStatus, Page, PaginationInfo, QuietDay, Recipient, RecipientOutcome,
    UserNotification, UserNotificationPreferences, UserNotificationQuery, UserNotificationView,
};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Rows per multi-row INSERT; keeps bind parameters well under the protocol limit.
const INSERT_CHUNK: usize = 1000;

const NOTIFICATION_COLUMNS: &str = "id, tenant_id, title, message, notification_type, priority, \
    category, channels, target_type, target_user_ids, target_roles, target_class_ids, \
    template_id, template_data, scheduled_at, expires_at, status, total_targets, read_count, \
    error_message, created_by, created_at, updated_at, sent_at, delivered_at";

const LOG_COLUMNS: &str = "id, notification_id, user_id, channel, recipient, status, \
    provider_message_id, provider_response, error_message, sent_at, failed_at";

const USER_NOTIFICATION_COLUMNS: &str = "id, user_id, notification_id, is_delivered, \
    delivered_at, is_read, read_at, channel_data, created_at";

const PREFERENCE_COLUMNS: &str = "user_id, is_enabled, email_enabled, sms_enabled, push_enabled, \
    in_app_enabled, quiet_hours_enabled, quiet_hours_start, quiet_hours_end, quiet_hours_days, \
    category_preferences, created_at, updated_at";

/// Users joined with the profile tables that carry role-specific phone numbers.
const RECIPIENT_SELECT: &str = "SELECT u.id, u.tenant_id, u.role, u.display_name, u.email, \
    u.phone, g.phone AS parent_phone, s.phone AS staff_phone, u.is_active \
    FROM users u \
    LEFT JOIN guardian_profiles g ON g.user_id = u.id \
    LEFT JOIN staff_profiles s ON s.user_id = u.id";

#[derive(FromRow)]
struct NotificationRow {
    id: Uuid,
    tenant_id: Uuid,
    title: String,
    message: String,
    notification_type: String,
    priority: String,
    category: String,
    channels: Vec<String>,
    target_type: String,
    target_user_ids: Vec<Uuid>,
    target_roles: Vec<String>,
    target_class_ids: Vec<Uuid>,
    template_id: Option<String>,
    template_data: Option<Value>,
    scheduled_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    status: String,
    total_targets: i64,
    read_count: i64,
    error_message: Option<String>,
    created_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = NotificationError;

    fn try_from(row: NotificationRow) -> Result<Self> {
        let channels = row
            .channels
            .iter()
            .map(|c| c.parse::<ChannelKind>())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Notification {
            id: row.id,
            tenant_id: row.tenant_id,
            title: row.title,
            message: row.message,
            notification_type: row.notification_type,
            priority: row.priority.parse()?,
            category: row.category.parse()?,
            channels,
            target_type: row.target_type.parse()?,
            target_user_ids: row.target_user_ids,
            target_roles: row.target_roles,
            target_class_ids: row.target_class_ids,
            template_id: row.template_id,
            template_data: row.template_data,
            scheduled_at: row.scheduled_at,
            expires_at: row.expires_at,
            status: row.status.parse()?,
            total_targets: row.total_targets,
            read_count: row.read_count,
            error_message: row.error_message,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
        })
    }
}

#[derive(FromRow)]
struct DeliveryLogRow {
    id: Uuid,
    notification_id: Uuid,
    user_id: Uuid,
    channel: String,
    recipient: String,
    status: String,
    provider_message_id: Option<String>,
    provider_response: Option<Value>,
    error_message: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeliveryLogRow> for DeliveryLog {
    type Error = NotificationError;

    fn try_from(row: DeliveryLogRow) -> Result<Self> {
        Ok(DeliveryLog {
            id: row.id,
            notification_id: row.notification_id,
            user_id: row.user_id,
            channel: row.channel.parse()?,
            recipient: row.recipient,
            status: row.status.parse()?,
            provider_message_id: row.provider_message_id,
            provider_response: row.provider_response,
            error_message: row.error_message,
            sent_at: row.sent_at,
            failed_at: row.failed_at,
        })
    }
}

#[derive(FromRow)]
struct UserNotificationRow {
    id: Uuid,
    user_id: Uuid,
    notification_id: Uuid,
    is_delivered: bool,
    delivered_at: Option<DateTime<Utc>>,
    is_read: bool,
    read_at: Option<DateTime<Utc>>,
    channel_data: Json<BTreeMap<ChannelKind, RecipientOutcome>>,
    created_at: DateTime<Utc>,
}

impl From<UserNotificationRow> for UserNotification {
    fn from(row: UserNotificationRow) -> Self {
        UserNotification {
            id: row.id,
            user_id: row.user_id,
            notification_id: row.notification_id,
            is_delivered: row.is_delivered,
            delivered_at: row.delivered_at,
            is_read: row.is_read,
            read_at: row.read_at,
            channel_data: row.channel_data.0,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct UserNotificationViewRow {
    id: Uuid,
    notification_id: Uuid,
    title: String,
    message: String,
    notification_type: String,
    category: String,
    priority: String,
    is_delivered: bool,
    delivered_at: Option<DateTime<Utc>>,
    is_read: bool,
    read_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserNotificationViewRow> for UserNotificationView {
    type Error = NotificationError;

    fn try_from(row: UserNotificationViewRow) -> Result<Self> {
        Ok(UserNotificationView {
            id: row.id,
            notification_id: row.notification_id,
            title: row.title,
            message: row.message,
            notification_type: row.notification_type,
            category: row.category.parse()?,
            priority: row.priority.parse()?,
            is_delivered: row.is_delivered,
            delivered_at: row.delivered_at,
            is_read: row.is_read,
            read_at: row.read_at,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct RecipientRow {
    id: Uuid,
    tenant_id: Uuid,
    role: String,
    display_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    parent_phone: Option<String>,
    staff_phone: Option<String>,
    is_active: bool,
}

impl From<RecipientRow> for Recipient {
    fn from(row: RecipientRow) -> Self {
        Recipient {
            id: row.id,
            tenant_id: row.tenant_id,
            role: row.role,
            display_name: row.display_name,
            email: row.email,
            phone: row.phone,
            parent_phone: row.parent_phone,
            staff_phone: row.staff_phone,
            is_active: row.is_active,
        }
    }
}

#[derive(FromRow)]
struct PreferenceRow {
    user_id: Uuid,
    is_enabled: bool,
    email_enabled: bool,
    sms_enabled: bool,
    push_enabled: bool,
    in_app_enabled: bool,
    quiet_hours_enabled: bool,
    quiet_hours_start: String,
    quiet_hours_end: String,
    quiet_hours_days: Vec<String>,
    category_preferences: Json<BTreeMap<String, BTreeMap<String, ChannelToggles>>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PreferenceRow> for UserNotificationPreferences {
    type Error = NotificationError;

    fn try_from(row: PreferenceRow) -> Result<Self> {
        let quiet_hours_days = row
            .quiet_hours_days
            .iter()
            .map(|d| d.parse::<QuietDay>())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(UserNotificationPreferences {
            user_id: row.user_id,
            is_enabled: row.is_enabled,
            email_enabled: row.email_enabled,
            sms_enabled: row.sms_enabled,
            push_enabled: row.push_enabled,
            in_app_enabled: row.in_app_enabled,
            quiet_hours_enabled: row.quiet_hours_enabled,
            quiet_hours_start: row.quiet_hours_start,
            quiet_hours_end: row.quiet_hours_end,
            quiet_hours_days,
            category_preferences: row.category_preferences.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Store backed by a PostgreSQL pool; all three store traits share it.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_pool_size)
            .min_connections(config.min_pool_size)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_seconds)))
            .connect(&config.postgres_url)
            .await?;

        info!(
            max = config.max_pool_size,
            min = config.min_pool_size,
            "PostgreSQL pool established"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn status_strings(statuses: &[NotificationStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl NotificationStore for PostgresStore {
    async fn insert_notification(&self, n: &Notification) -> Result<()> {
        let query = format!(
            "INSERT INTO notifications ({NOTIFICATION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                     $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)"
        );
        let channels: Vec<String> = n.channels.iter().map(|c| c.as_str().to_string()).collect();

        sqlx::query(&query)
            .bind(n.id)
            .bind(n.tenant_id)
            .bind(&n.title)
            .bind(&n.message)
            .bind(&n.notification_type)
            .bind(n.priority.as_str())
            .bind(n.category.as_str())
            .bind(&channels)
            .bind(n.target_type.as_str())
            .bind(&n.target_user_ids)
            .bind(&n.target_roles)
            .bind(&n.target_class_ids)
            .bind(&n.template_id)
            .bind(&n.template_data)
            .bind(n.scheduled_at)
            .bind(n.expires_at)
            .bind(n.status.as_str())
            .bind(n.total_targets)
            .bind(n.read_count)
            .bind(&n.error_message)
            .bind(n.created_by)
            .bind(n.created_at)
            .bind(n.updated_at)
            .bind(n.sent_at)
            .bind(n.delivered_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>> {
        let query = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = $1");
        sqlx::query_as::<_, NotificationRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Notification::try_from)
            .transpose()
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: &[NotificationStatus],
        to: NotificationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET \
                status = $1, \
                updated_at = $2, \
                sent_at = CASE WHEN $1 = 'SENDING' THEN $2 ELSE sent_at END \
             WHERE id = $3 AND status = ANY($4)",
        )
        .bind(to.as_str())
        .bind(now)
        .bind(id)
        .bind(status_strings(from))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_notification(
        &self,
        id: Uuid,
        outcome: &DispatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE notifications SET \
                status = $1, total_targets = $2, delivered_at = $3, \
                error_message = NULL, updated_at = $4 \
             WHERE id = $5",
        )
        .bind(outcome.status.as_str())
        .bind(outcome.total_targets)
        .bind(outcome.delivered_at)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE notifications SET status = 'FAILED', error_message = $1, updated_at = $2 \
             WHERE id = $3",
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_delivery_logs(&self, logs: &[DeliveryLog]) -> Result<()> {
        for chunk in logs.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO notification_delivery_logs ({LOG_COLUMNS}) "
            ));
            builder.push_values(chunk, |mut b, log| {
                b.push_bind(log.id)
                    .push_bind(log.notification_id)
                    .push_bind(log.user_id)
                    .push_bind(log.channel.as_str())
                    .push_bind(&log.recipient)
                    .push_bind(log.status.as_str())
                    .push_bind(&log.provider_message_id)
                    .push_bind(&log.provider_response)
                    .push_bind(&log.error_message)
                    .push_bind(log.sent_at)
                    .push_bind(log.failed_at);
            });
            builder.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn delivery_logs(&self, notification_id: Uuid) -> Result<Vec<DeliveryLog>> {
        let query = format!(
            "SELECT {LOG_COLUMNS} FROM notification_delivery_logs \
             WHERE notification_id = $1 \
             ORDER BY COALESCE(sent_at, failed_at), id"
        );
        sqlx::query_as::<_, DeliveryLogRow>(&query)
            .bind(notification_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(DeliveryLog::try_from)
            .collect()
    }

    async fn insert_user_notifications(&self, rows: &[UserNotification]) -> Result<()> {
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO user_notifications ({USER_NOTIFICATION_COLUMNS}) "
            ));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(row.user_id)
                    .push_bind(row.notification_id)
                    .push_bind(row.is_delivered)
                    .push_bind(row.delivered_at)
                    .push_bind(row.is_read)
                    .push_bind(row.read_at)
                    .push_bind(Json(&row.channel_data))
                    .push_bind(row.created_at);
            });
            builder.push(" ON CONFLICT (notification_id, user_id) DO NOTHING");
            builder.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn user_notifications(&self, notification_id: Uuid) -> Result<Vec<UserNotification>> {
        let query = format!(
            "SELECT {USER_NOTIFICATION_COLUMNS} FROM user_notifications \
             WHERE notification_id = $1 ORDER BY user_id"
        );
        let rows = sqlx::query_as::<_, UserNotificationRow>(&query)
            .bind(notification_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(UserNotification::from).collect())
    }

    async fn mark_read(
        &self,
        notification_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReadOutcome> {
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query(
            "UPDATE user_notifications SET is_read = TRUE, read_at = $3 \
             WHERE notification_id = $1 AND user_id = $2 AND is_read = FALSE",
        )
        .bind(notification_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if marked == 0 {
            let exists: Option<bool> = sqlx::query_scalar(
                "SELECT is_read FROM user_notifications WHERE notification_id = $1 AND user_id = $2",
            )
            .bind(notification_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(match exists {
                Some(_) => ReadOutcome::AlreadyRead,
                None => ReadOutcome::NotFound,
            });
        }

        sqlx::query("UPDATE notifications SET read_count = read_count + 1 WHERE id = $1")
            .bind(notification_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(ReadOutcome::Marked)
    }

    async fn mark_all_read(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "WITH marked AS ( \
                UPDATE user_notifications SET is_read = TRUE, read_at = $2 \
                WHERE user_id = $1 AND is_read = FALSE \
                RETURNING notification_id \
             ), bumped AS ( \
                UPDATE notifications n SET read_count = n.read_count + 1 \
                FROM marked m WHERE n.id = m.notification_id \
                RETURNING n.id \
             ) \
             SELECT COUNT(*) FROM marked",
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn unread_count(&self, user_id: Uuid) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_notifications WHERE user_id = $1 AND is_read = FALSE",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_user_notifications(
        &self,
        user_id: Uuid,
        query: &UserNotificationQuery,
    ) -> Result<Page<UserNotificationView>> {
        const FILTER: &str = "FROM user_notifications un \
            JOIN notifications n ON n.id = un.notification_id \
            WHERE un.user_id = $1 \
              AND ($2 = FALSE OR un.is_read = FALSE) \
              AND ($3::text IS NULL OR n.notification_type = $3) \
              AND ($4::text IS NULL OR n.category = $4)";

        let (page, limit) = query.normalized();
        let category = query.category.map(|c| c.as_str());

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) {FILTER}"))
            .bind(user_id)
            .bind(query.unread_only)
            .bind(&query.notification_type)
            .bind(category)
            .fetch_one(&self.pool)
            .await?;

        let select = format!(
            "SELECT un.id, un.notification_id, n.title, n.message, n.notification_type, \
                    n.category, n.priority, un.is_delivered, un.delivered_at, un.is_read, \
                    un.read_at, un.created_at \
             {FILTER} \
             ORDER BY un.created_at DESC, un.id \
             LIMIT $5 OFFSET $6"
        );
        let items = sqlx::query_as::<_, UserNotificationViewRow>(&select)
            .bind(user_id)
            .bind(query.unread_only)
            .bind(&query.notification_type)
            .bind(category)
            .bind(i64::from(limit))
            .bind(query.offset() as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(UserNotificationView::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            pagination: PaginationInfo::new(page, limit, total.max(0) as u64),
        })
    }

    async fn delivery_stats(
        &self,
        notification_id: Uuid,
    ) -> Result<BTreeMap<ChannelKind, ChannelDeliveryStats>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT channel, status, COUNT(*) FROM notification_delivery_logs \
             WHERE notification_id = $1 GROUP BY channel, status",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats: BTreeMap<ChannelKind, ChannelDeliveryStats> = BTreeMap::new();
        for (channel, status, count) in rows {
            let entry = stats.entry(channel.parse()?).or_default();
            match status.parse::<DeliveryStatus>()? {
                DeliveryStatus::Delivered => entry.delivered += count.max(0) as u64,
                DeliveryStatus::Failed => entry.failed += count.max(0) as u64,
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(sqlx::query("SELECT 1").execute(&self.pool).await.is_ok())
    }
}

#[async_trait]
impl DirectoryStore for PostgresStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<Recipient>> {
        let query = format!("{RECIPIENT_SELECT} WHERE u.id = $1");
        let row = sqlx::query_as::<_, RecipientRow>(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Recipient::from))
    }

    async fn active_users(&self, tenant_id: Uuid) -> Result<Vec<Recipient>> {
        let query = format!(
            "{RECIPIENT_SELECT} WHERE u.tenant_id = $1 AND u.is_active = TRUE ORDER BY u.id"
        );
        let rows = sqlx::query_as::<_, RecipientRow>(&query)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Recipient::from).collect())
    }

    async fn active_users_by_ids(&self, tenant_id: Uuid, ids: &[Uuid]) -> Result<Vec<Recipient>> {
        let query = format!(
            "{RECIPIENT_SELECT} \
             WHERE u.tenant_id = $1 AND u.is_active = TRUE AND u.id = ANY($2) \
             ORDER BY u.id"
        );
        let rows = sqlx::query_as::<_, RecipientRow>(&query)
            .bind(tenant_id)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Recipient::from).collect())
    }

    async fn active_users_by_roles(
        &self,
        tenant_id: Uuid,
        roles: &[String],
    ) -> Result<Vec<Recipient>> {
        let roles: Vec<String> = roles.iter().map(|r| r.to_ascii_uppercase()).collect();
        let query = format!(
            "{RECIPIENT_SELECT} \
             WHERE u.tenant_id = $1 AND u.is_active = TRUE AND UPPER(u.role) = ANY($2) \
             ORDER BY u.id"
        );
        let rows = sqlx::query_as::<_, RecipientRow>(&query)
            .bind(tenant_id)
            .bind(&roles)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Recipient::from).collect())
    }

    async fn active_users_by_classes(
        &self,
        tenant_id: Uuid,
        class_ids: &[Uuid],
    ) -> Result<Vec<Recipient>> {
        let query = format!(
            "{RECIPIENT_SELECT} \
             WHERE u.tenant_id = $1 AND u.is_active = TRUE AND u.id IN ( \
                SELECT st.user_id FROM students st \
                WHERE st.tenant_id = $1 AND st.status = 'ACTIVE' \
                  AND st.class_id = ANY($2) AND st.user_id IS NOT NULL \
                UNION \
                SELECT sg.guardian_user_id FROM student_guardians sg \
                JOIN students st ON st.id = sg.student_id \
                WHERE st.tenant_id = $1 AND st.status = 'ACTIVE' AND st.class_id = ANY($2) \
             ) \
             ORDER BY u.id"
        );
        let rows = sqlx::query_as::<_, RecipientRow>(&query)
            .bind(tenant_id)
            .bind(class_ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Recipient::from).collect())
    }
}

#[async_trait]
impl PreferenceStore for PostgresStore {
    async fn get_preferences(&self, user_id: Uuid) -> Result<Option<UserNotificationPreferences>> {
        let query = format!(
            "SELECT {PREFERENCE_COLUMNS} FROM user_notification_preferences WHERE user_id = $1"
        );
        sqlx::query_as::<_, PreferenceRow>(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(UserNotificationPreferences::try_from)
            .transpose()
    }

    async fn get_preferences_many(
        &self,
        user_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, UserNotificationPreferences>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let query = format!(
            "SELECT {PREFERENCE_COLUMNS} FROM user_notification_preferences \
             WHERE user_id = ANY($1)"
        );
        sqlx::query_as::<_, PreferenceRow>(&query)
            .bind(user_ids)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| UserNotificationPreferences::try_from(row).map(|p| (p.user_id, p)))
            .collect()
    }

    /// `INSERT ... ON CONFLICT (user_id) DO UPDATE`; `created_at` of an
    /// existing row is never overwritten.
    async fn upsert_preferences(&self, p: &UserNotificationPreferences) -> Result<()> {
        let days: Vec<String> = p
            .quiet_hours_days
            .iter()
            .map(|d| d.as_str().to_string())
            .collect();
        let query = format!(
            "INSERT INTO user_notification_preferences ({PREFERENCE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (user_id) DO UPDATE SET \
                is_enabled = EXCLUDED.is_enabled, \
                email_enabled = EXCLUDED.email_enabled, \
                sms_enabled = EXCLUDED.sms_enabled, \
                push_enabled = EXCLUDED.push_enabled, \
                in_app_enabled = EXCLUDED.in_app_enabled, \
                quiet_hours_enabled = EXCLUDED.quiet_hours_enabled, \
                quiet_hours_start = EXCLUDED.quiet_hours_start, \
                quiet_hours_end = EXCLUDED.quiet_hours_end, \
                quiet_hours_days = EXCLUDED.quiet_hours_days, \
                category_preferences = EXCLUDED.category_preferences, \
                updated_at = EXCLUDED.updated_at"
        );
        sqlx::query(&query)
            .bind(p.user_id)
            .bind(p.is_enabled)
            .bind(p.email_enabled)
            .bind(p.sms_enabled)
            .bind(p.push_enabled)
            .bind(p.in_app_enabled)
            .bind(p.quiet_hours_enabled)
            .bind(&p.quiet_hours_start)
            .bind(&p.quiet_hours_end)
            .bind(&days)
            .bind(Json(&p.category_preferences))
            .bind(p.created_at)
            .bind(p.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
