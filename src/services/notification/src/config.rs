//! Configuration module for the notification service
//!
//! Values are layered: built-in defaults, then an optional config file, then
//! `NOTIFICATION__SECTION__KEY` environment variables.

use edu_core_shared::types::ChannelKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Main configuration structure for the notification service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    /// Delayed/retrying job queue for scheduled processing
    pub queue: QueueConfig,
    /// Orchestrator tuning
    pub dispatch: DispatchConfig,
    pub email: EmailConfig,
    pub sms: SmsConfig,
    pub push: PushConfig,
    pub in_app: InAppConfig,
    pub webhook: WebhookConfig,
    pub template: TemplateConfig,
    pub metrics: MetricsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub timeout_seconds: u64,
    pub cors_allowed_origins: Vec<String>,
}

/// Database configuration
///
/// An empty `postgres_url` selects the in-memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub postgres_url: String,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub connection_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub run_migrations: bool,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
    pub connection_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    Memory,
    Redis,
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Total attempts per job, including the first one
    pub attempts: u32,
    /// Base delay of the exponential retry backoff
    pub backoff_base_ms: u64,
    pub poll_interval_ms: u64,
    pub fetch_batch_size: usize,
    pub worker_concurrency: usize,
    /// Number of permanently failed jobs kept for inspection
    pub failed_retention: usize,
    /// How long a claimed job stays invisible before another worker may
    /// claim it again
    pub lease_ms: u64,
}

/// Dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Recipients sent to one channel concurrently
    pub batch_size: usize,
    /// IANA zone used for quiet-hours evaluation
    pub timezone: String,
}

/// Email configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_use_tls: bool,
    pub from_email: String,
    pub from_name: String,
    pub reply_to: Option<String>,
    pub timeout_seconds: u64,
}

/// SMS gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub enabled: bool,
    pub gateway_url: String,
    pub api_key: String,
    pub sender_id: String,
    pub timeout_seconds: u64,
}

/// Push gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub enabled: bool,
    pub gateway_url: String,
    pub server_key: String,
    pub timeout_seconds: u64,
}

/// In-app channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InAppConfig {
    pub enabled: bool,
    /// Capacity of the broadcast buffer shared by all subscribers
    pub buffer_size: usize,
}

/// Webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub enabled: bool,
    /// Endpoints that receive every webhook delivery
    pub endpoints: Vec<String>,
    pub timeout_seconds: u64,
    pub verify_ssl: bool,
    pub user_agent: String,
}

/// Template configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub template_directory: Option<String>,
    pub strict_mode: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub namespace: String,
    pub histogram_buckets: Vec<f64>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            queue: QueueConfig::default(),
            dispatch: DispatchConfig::default(),
            email: EmailConfig::default(),
            sms: SmsConfig::default(),
            push: PushConfig::default(),
            in_app: InAppConfig::default(),
            webhook: WebhookConfig::default(),
            template: TemplateConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8086,
            timeout_seconds: 30,
            cors_allowed_origins: vec!["*".to_string()],
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            postgres_url: std::env::var("DATABASE_URL").unwrap_or_default(),
            max_pool_size: 20,
            min_pool_size: 2,
            connection_timeout_seconds: 30,
            idle_timeout_seconds: 600,
            run_migrations: true,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: "notification:".to_string(),
            connection_timeout_seconds: 5,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            attempts: 3,
            backoff_base_ms: 2000,
            poll_interval_ms: 1000,
            fetch_batch_size: 20,
            worker_concurrency: num_cpus::get().max(2),
            failed_retention: 1000,
            lease_ms: 300_000,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            timezone: "UTC".to_string(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            smtp_port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(587),
            smtp_username: std::env::var("SMTP_USERNAME").unwrap_or_default(),
            smtp_password: std::env::var("SMTP_PASSWORD").unwrap_or_default(),
            smtp_use_tls: false,
            from_email: std::env::var("FROM_EMAIL")
                .unwrap_or_else(|_| "noreply@edu-core.local".to_string()),
            from_name: std::env::var("FROM_NAME").unwrap_or_else(|_| "EDU-CORE".to_string()),
            reply_to: std::env::var("REPLY_TO_EMAIL").ok(),
            timeout_seconds: 30,
        }
    }
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: false, // Disabled by default due to cost
            gateway_url: std::env::var("SMS_GATEWAY_URL").unwrap_or_default(),
            api_key: std::env::var("SMS_API_KEY").unwrap_or_default(),
            sender_id: "EDUCORE".to_string(),
            timeout_seconds: 15,
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gateway_url: std::env::var("PUSH_GATEWAY_URL").unwrap_or_default(),
            server_key: std::env::var("PUSH_SERVER_KEY").unwrap_or_default(),
            timeout_seconds: 15,
        }
    }
}

impl Default for InAppConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: 1024,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoints: Vec::new(),
            timeout_seconds: 30,
            verify_ssl: true,
            user_agent: "EDU-CORE-Notification-Service/1.0".to_string(),
        }
    }
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            template_directory: None,
            strict_mode: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "notification_service".to_string(),
            histogram_buckets: vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        }
    }
}

impl NotificationConfig {
    /// Load configuration from defaults, an optional file and the environment
    ///
    /// `config_file` takes precedence over `NOTIFICATION_CONFIG_FILE`.
    pub fn load(config_file: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut cfg = config::Config::builder();

        cfg = cfg.add_source(config::Config::try_from(&NotificationConfig::default())?);

        let file = config_file
            .map(str::to_string)
            .or_else(|| std::env::var("NOTIFICATION_CONFIG_FILE").ok());
        if let Some(file) = file {
            cfg = cfg.add_source(config::File::with_name(&file).required(false));
        }

        cfg = cfg.add_source(
            config::Environment::with_prefix("NOTIFICATION")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("webhook.endpoints")
                .with_list_parse_key("server.cors_allowed_origins")
                .try_parsing(true),
        );

        cfg.build()?.try_deserialize()
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port must be greater than 0".to_string());
        }

        if self.dispatch.batch_size == 0 {
            return Err("Dispatch batch size must be greater than 0".to_string());
        }

        if self.dispatch.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(format!("Unknown timezone: {}", self.dispatch.timezone));
        }

        if self.queue.attempts == 0 {
            return Err("Queue attempts must be greater than 0".to_string());
        }

        if self.queue.lease_ms == 0 {
            return Err("Queue lease must be greater than 0".to_string());
        }

        if self.queue.worker_concurrency == 0 || self.queue.fetch_batch_size == 0 {
            return Err("Queue concurrency and fetch batch size must be greater than 0".to_string());
        }

        if self.queue.backend == QueueBackend::Redis && self.redis.url.is_empty() {
            return Err("Redis URL is required when the queue backend is redis".to_string());
        }

        if self.email.enabled {
            if self.email.smtp_host.is_empty() {
                return Err("SMTP host is required when email is enabled".to_string());
            }
            if self.email.from_email.is_empty() {
                return Err("From email is required when email is enabled".to_string());
            }
        }

        if self.sms.enabled && self.sms.gateway_url.is_empty() {
            return Err("SMS gateway URL is required when SMS is enabled".to_string());
        }

        if self.push.enabled && self.push.gateway_url.is_empty() {
            return Err("Push gateway URL is required when push is enabled".to_string());
        }

        if self.in_app.enabled && self.in_app.buffer_size == 0 {
            return Err("In-app buffer size must be greater than 0".to_string());
        }

        if self.webhook.enabled && self.webhook.endpoints.is_empty() {
            return Err("At least one endpoint is required when webhooks are enabled".to_string());
        }

        Ok(())
    }

    /// Parsed quiet-hours timezone, falling back to UTC
    pub fn timezone(&self) -> chrono_tz::Tz {
        self.dispatch.timezone.parse().unwrap_or(chrono_tz::UTC)
    }

    /// Get timeout duration for the specified channel
    pub fn get_timeout(&self, channel: ChannelKind) -> Duration {
        let seconds = match channel {
            ChannelKind::Email => self.email.timeout_seconds,
            ChannelKind::Sms => self.sms.timeout_seconds,
            ChannelKind::Push => self.push.timeout_seconds,
            ChannelKind::Webhook => self.webhook.timeout_seconds,
            ChannelKind::InApp => self.server.timeout_seconds,
        };
        Duration::from_secs(seconds)
    }

    /// System-level switch for a channel
    pub fn is_channel_enabled(&self, channel: ChannelKind) -> bool {
        match channel {
            ChannelKind::Email => self.email.enabled,
            ChannelKind::Sms => self.sms.enabled,
            ChannelKind::Push => self.push.enabled,
            ChannelKind::InApp => self.in_app.enabled,
            ChannelKind::Webhook => self.webhook.enabled,
        }
    }

    pub fn enabled_channels(&self) -> BTreeSet<ChannelKind> {
        ChannelKind::ALL
            .into_iter()
            .filter(|channel| self.is_channel_enabled(*channel))
            .collect()
    }

    pub fn uses_postgres(&self) -> bool {
        !self.database.postgres_url.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NotificationConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8086);
        assert_eq!(config.dispatch.batch_size, 100);
        assert_eq!(config.queue.attempts, 3);
        assert_eq!(config.queue.backoff_base_ms, 2000);
        assert_eq!(config.queue.lease_ms, 300_000);
        assert!(config.in_app.enabled);
        assert!(!config.sms.enabled);
        assert!(!config.webhook.enabled);
    }

    #[test]
    fn test_config_validation() {
        let config = NotificationConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.server.port = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.dispatch.batch_size = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.dispatch.timezone = "Mars/Olympus".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.queue.lease_ms = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.sms.enabled = true;
        invalid.sms.gateway_url = String::new();
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_timezone_parsing() {
        let mut config = NotificationConfig::default();
        assert_eq!(config.timezone(), chrono_tz::UTC);

        config.dispatch.timezone = "Africa/Nairobi".to_string();
        assert_eq!(config.timezone(), chrono_tz::Africa::Nairobi);
    }

    #[test]
    fn test_timeout_getter() {
        let config = NotificationConfig::default();
        assert_eq!(config.get_timeout(ChannelKind::Email), Duration::from_secs(30));
        assert_eq!(config.get_timeout(ChannelKind::Sms), Duration::from_secs(15));
    }

    #[test]
    fn test_channel_enabled_check() {
        let mut config = NotificationConfig::default();
        config.email.enabled = true;
        assert!(config.is_channel_enabled(ChannelKind::Email));
        assert!(!config.is_channel_enabled(ChannelKind::Sms));
        assert!(config.is_channel_enabled(ChannelKind::InApp));

        let enabled = config.enabled_channels();
        assert!(enabled.contains(&ChannelKind::Email));
        assert!(!enabled.contains(&ChannelKind::Webhook));
    }
}
