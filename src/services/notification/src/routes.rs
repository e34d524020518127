//! Routes module for the notification service
//!
//! - Notification submission and lifecycle
//! - Per-user inbox and preferences
//! - Health and metrics endpoints

use crate::config::ServerConfig;
use crate::handlers::{
    health_handler, metrics_handler, notifications_handler, preferences_handler, users_handler,
    AppState,
};

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::warn;

/// Build the main router for the notification service
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    Router::new()
        .merge(create_api_router())
        .merge(create_health_router())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&server.cors_allowed_origins))
                .layer(TimeoutLayer::new(Duration::from_secs(server.timeout_seconds)))
                .into_inner(),
        )
}

/// Create API routes for REST endpoints
fn create_api_router() -> Router<AppState> {
    Router::new()
        // Notification endpoints
        .route(
            "/api/v1/notifications",
            post(notifications_handler::submit_notification),
        )
        .route(
            "/api/v1/notifications/:id",
            get(notifications_handler::get_notification),
        )
        .route(
            "/api/v1/notifications/:id/process",
            post(notifications_handler::process_notification),
        )
        .route(
            "/api/v1/notifications/:id/cancel",
            post(notifications_handler::cancel_notification),
        )
        .route(
            "/api/v1/notifications/:id/stats",
            get(notifications_handler::delivery_stats),
        )
        .route(
            "/api/v1/notifications/:id/read",
            post(notifications_handler::mark_as_read),
        )
        // User inbox endpoints
        .route(
            "/api/v1/users/:user_id/notifications",
            get(users_handler::list_notifications),
        )
        .route(
            "/api/v1/users/:user_id/notifications/unread-count",
            get(users_handler::unread_count),
        )
        .route(
            "/api/v1/users/:user_id/notifications/read-all",
            post(users_handler::mark_all_as_read),
        )
        // Preference endpoints
        .route(
            "/api/v1/users/:user_id/preferences",
            get(preferences_handler::get_preferences)
                .patch(preferences_handler::update_preferences),
        )
        .route(
            "/api/v1/users/:user_id/preferences/reset",
            post(preferences_handler::reset_preferences),
        )
}

/// Create health and metrics routes
fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
}

/// `*` or an empty list allows any origin
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::permissive().allow_origin(allowed)
}
