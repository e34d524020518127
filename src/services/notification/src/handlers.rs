//! Request handlers for the notification service
//!
//! Thin HTTP adapters over [`NotificationManager`]:
//! - notification submission, lookup, processing and cancellation
//! - per-user inbox and read state
//! - per-user preferences
//! - health and metrics

use crate::error::{NotificationError, Result};
use crate::manager::NotificationManager;
use crate::metrics::NotificationMetrics;
use crate::store::ReadOutcome;
use edu_core_shared::types::*;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<NotificationManager>,
    pub metrics: Option<NotificationMetrics>,
}

pub mod notifications_handler {
    use super::*;

    #[derive(Debug, Deserialize)]
    pub struct TenantQuery {
        pub tenant_id: Option<Uuid>,
    }

    #[derive(Debug, Deserialize)]
    pub struct MarkReadRequest {
        pub user_id: Uuid,
    }

    /// Submit a notification; scheduled sends answer 202
    pub async fn submit_notification(
        State(state): State<AppState>,
        Json(request): Json<SubmitNotificationRequest>,
    ) -> Result<impl IntoResponse> {
        let response = state.manager.submit(request).await?;
        let status = match response.status {
            NotificationStatus::Scheduled => StatusCode::ACCEPTED,
            _ => StatusCode::CREATED,
        };
        Ok((status, Json(response)))
    }

    pub async fn get_notification(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
        Query(query): Query<TenantQuery>,
    ) -> Result<impl IntoResponse> {
        let details = state.manager.get_notification(id, query.tenant_id).await?;
        Ok(Json(details))
    }

    /// Operator entry point with the same guard as the queue path
    pub async fn process_notification(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
    ) -> Result<impl IntoResponse> {
        info!(notification_id = %id, "Manual processing requested");
        let summary = state.manager.process(id).await?;
        Ok(Json(summary))
    }

    pub async fn cancel_notification(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
        Query(query): Query<TenantQuery>,
    ) -> Result<impl IntoResponse> {
        let notification = state.manager.cancel(id, query.tenant_id).await?;
        Ok(Json(notification))
    }

    pub async fn delivery_stats(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
        Query(query): Query<TenantQuery>,
    ) -> Result<impl IntoResponse> {
        let stats = state.manager.delivery_stats(id, query.tenant_id).await?;
        Ok(Json(stats))
    }

    pub async fn mark_as_read(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
        Json(request): Json<MarkReadRequest>,
    ) -> Result<impl IntoResponse> {
        let outcome = state.manager.mark_as_read(id, request.user_id).await?;
        Ok(Json(json!({
            "notification_id": id,
            "user_id": request.user_id,
            "already_read": outcome == ReadOutcome::AlreadyRead,
        })))
    }
}

pub mod users_handler {
    use super::*;

    pub async fn list_notifications(
        State(state): State<AppState>,
        Path(user_id): Path<Uuid>,
        Query(query): Query<UserNotificationQuery>,
    ) -> Result<impl IntoResponse> {
        let page = state
            .manager
            .list_user_notifications(user_id, &query)
            .await?;
        Ok(Json(page))
    }

    pub async fn unread_count(
        State(state): State<AppState>,
        Path(user_id): Path<Uuid>,
    ) -> Result<impl IntoResponse> {
        let count = state.manager.unread_count(user_id).await?;
        Ok(Json(json!({ "user_id": user_id, "unread_count": count })))
    }

    pub async fn mark_all_as_read(
        State(state): State<AppState>,
        Path(user_id): Path<Uuid>,
    ) -> Result<impl IntoResponse> {
        let marked = state.manager.mark_all_as_read(user_id).await?;
        Ok(Json(json!({ "user_id": user_id, "marked": marked })))
    }
}

pub mod preferences_handler {
    use super::*;

    pub async fn get_preferences(
        State(state): State<AppState>,
        Path(user_id): Path<Uuid>,
    ) -> Result<impl IntoResponse> {
        Ok(Json(state.manager.get_user_preferences(user_id).await?))
    }

    pub async fn update_preferences(
        State(state): State<AppState>,
        Path(user_id): Path<Uuid>,
        Json(update): Json<UpdatePreferencesRequest>,
    ) -> Result<impl IntoResponse> {
        let preferences = state
            .manager
            .update_user_preferences(user_id, &update)
            .await?;
        info!(user_id = %user_id, "Preferences updated");
        Ok(Json(preferences))
    }

    pub async fn reset_preferences(
        State(state): State<AppState>,
        Path(user_id): Path<Uuid>,
    ) -> Result<impl IntoResponse> {
        let preferences = state.manager.reset_user_preferences(user_id).await?;
        info!(user_id = %user_id, "Preferences reset to role defaults");
        Ok(Json(preferences))
    }
}

/// Health check handler; a degraded dependency answers 503
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.manager.health_check().await;
    let status = if health["status"] == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// Prometheus text exposition
pub async fn metrics_handler(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let metrics = state
        .metrics
        .as_ref()
        .ok_or_else(|| NotificationError::service_unavailable("metrics"))?;

    match metrics.export() {
        Ok(body) => Ok((
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )),
        Err(e) => {
            error!(error = %e, "Failed to export metrics");
            Err(e)
        }
    }
}
