//! # Notification Service
//!
//! Multi-channel notification dispatch engine for the EDU-CORE school platform:
//! - Tenant-scoped targeting (all users, specific users, roles, classes, combinations)
//! - Per-user preference and quiet-hours filtering
//! - Batched delivery over email, SMS, push, in-app and webhook channels
//! - Per-recipient delivery logs and inbox rows with read tracking
//! - Deferred sends through a retrying job queue
//!
//! ## Usage
//!
//! ```rust,no_run
//! use notification_service::{NotificationConfig, NotificationService};
//! use edu_core_shared::types::SubmitNotificationRequest;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = NotificationService::new(NotificationConfig::default()).await?;
//!
//!     let request: SubmitNotificationRequest = serde_json::from_value(serde_json::json!({
//!         "tenant_id": "6f1c1a52-8e59-4a53-9f0e-3f6a1c2d9b10",
//!         "title": "School closed",
//!         "message": "The school is closed tomorrow due to flooding.",
//!         "priority": "URGENT",
//!         "channels": ["IN_APP", "SMS"],
//!         "target_type": "ROLE_BASED",
//!         "target_roles": ["PARENT"]
//!     }))?;
//!
//!     let response = service.manager().submit(request).await?;
//!     println!("Notification {} is {}", response.notification_id, response.status);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod manager;
pub mod metrics;
pub mod preferences;
pub mod queue;
pub mod routes;
pub mod scheduler;
pub mod store;
pub mod targeting;
pub mod templates;
pub mod tracker;

pub use config::NotificationConfig;
pub use error::{NotificationError, Result};
pub use manager::{ManagerComponents, NotificationManager};
pub use scheduler::NotificationScheduler;

// Re-export shared types for convenience
pub use edu_core_shared::types::{
    ChannelKind, DeliveryLog, DeliveryStats, Notification, NotificationCategory,
    NotificationPriority, NotificationStatus, ProcessSummary, SubmitNotificationRequest,
    SubmitNotificationResponse, TargetType, UserNotificationPreferences,
};

use crate::channels::{ChannelRegistry, InAppChannel};
use crate::config::QueueBackend;
use crate::handlers::AppState;
use crate::metrics::NotificationMetrics;
use crate::queue::{JobQueue, MemoryJobQueue, RedisJobQueue};
use crate::store::{MemoryStore, PostgresStore};
use crate::templates::{HandlebarsRenderer, TemplateRenderer};
use tracing::{info, warn};

/// Fully wired service: stores, queue, channels, renderer and metrics
#[derive(Clone)]
pub struct NotificationService {
    config: NotificationConfig,
    manager: Arc<NotificationManager>,
    queue: Arc<dyn JobQueue>,
    in_app: Arc<InAppChannel>,
    metrics: Option<NotificationMetrics>,
    postgres: Option<PostgresStore>,
}

impl NotificationService {
    /// Connect every backend named by the configuration. Without a database
    /// URL the in-memory store is used.
    pub async fn new(config: NotificationConfig) -> Result<Self> {
        let metrics = if config.metrics.enabled {
            Some(NotificationMetrics::new(&config.metrics)?)
        } else {
            None
        };

        let (components_store, postgres) = if config.uses_postgres() {
            let store = PostgresStore::connect(&config.database).await?;
            if config.database.run_migrations {
                store.run_migrations().await?;
            }
            let shared = Arc::new(store.clone());
            (StoreHandles::from_arc(shared), Some(store))
        } else {
            warn!("No database URL configured; using the in-memory store");
            (StoreHandles::from_arc(Arc::new(MemoryStore::new())), None)
        };

        let queue: Arc<dyn JobQueue> = match config.queue.backend {
            QueueBackend::Redis => {
                Arc::new(RedisJobQueue::connect(&config.redis, &config.queue).await?)
            }
            QueueBackend::Memory => {
                info!("Using the in-memory job queue");
                Arc::new(MemoryJobQueue::new(config.queue.failed_retention))
            }
        };

        let (channels, in_app) = ChannelRegistry::from_config(&config)?;
        let renderer: Arc<dyn TemplateRenderer> = Arc::new(HandlebarsRenderer::new(&config.template)?);

        let manager = NotificationManager::new(
            ManagerComponents {
                notifications: components_store.notifications,
                directory: components_store.directory,
                preferences: components_store.preferences,
                queue: queue.clone(),
                channels,
                renderer: Some(renderer),
                metrics: metrics.clone(),
            },
            &config,
        );

        let store_kind = if postgres.is_some() { "postgres" } else { "memory" };
        info!(
            store = store_kind,
            queue = ?config.queue.backend,
            "Notification service initialized"
        );

        Ok(Self {
            config,
            manager: Arc::new(manager),
            queue,
            in_app,
            metrics,
            postgres,
        })
    }

    pub fn manager(&self) -> Arc<NotificationManager> {
        self.manager.clone()
    }

    /// Live in-app events for API consumers
    pub fn in_app(&self) -> Arc<InAppChannel> {
        self.in_app.clone()
    }

    pub fn metrics(&self) -> Option<NotificationMetrics> {
        self.metrics.clone()
    }

    /// Queue worker bound to this service's manager
    pub fn scheduler(&self) -> NotificationScheduler {
        let scheduler =
            NotificationScheduler::new(self.queue.clone(), self.manager.clone(), &self.config.queue);
        match self.metrics {
            Some(ref metrics) => scheduler.with_metrics(metrics.clone()),
            None => scheduler,
        }
    }

    pub fn router(&self) -> axum::Router {
        routes::create_router(
            AppState {
                manager: self.manager.clone(),
                metrics: self.metrics.clone(),
            },
            &self.config.server,
        )
    }

    pub async fn shutdown(&self) {
        if let Some(ref store) = self.postgres {
            store.close().await;
        }
    }
}

/// One backend seen through the three store traits
struct StoreHandles {
    notifications: Arc<dyn store::NotificationStore>,
    directory: Arc<dyn store::DirectoryStore>,
    preferences: Arc<dyn store::PreferenceStore>,
}

impl StoreHandles {
    fn from_arc<S>(store: Arc<S>) -> Self
    where
        S: store::NotificationStore + store::DirectoryStore + store::PreferenceStore + 'static,
    {
        Self {
            notifications: store.clone(),
            directory: store.clone(),
            preferences: store,
        }
    }
}
