//! Main binary for the EDU-CORE Notification Service
//!
//! Starts the dispatch engine with:
//! - Postgres or in-memory storage
//! - Redis or in-memory job queue with the background worker
//! - Email, SMS, push, in-app and webhook channels
//! - The HTTP API, health and Prometheus metrics endpoints

use notification_service::{config::NotificationConfig, NotificationService};

use anyhow::{anyhow, Context};
use clap::{Arg, ArgMatches, Command};
use std::net::SocketAddr;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "notification_service=info,tower_http=info,sqlx=warn";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Parse command line arguments
    let matches = create_cli().get_matches();

    // Initialize tracing
    init_tracing(matches.get_one::<String>("log-format").map(String::as_str))?;

    // Load configuration
    let config = load_config(&matches)?;
    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;

    info!("Starting EDU-CORE Notification Service");
    info!(
        host = %config.server.host,
        port = config.server.port,
        channels = ?config.enabled_channels(),
        timezone = %config.dispatch.timezone,
        "Configuration loaded"
    );

    let service = NotificationService::new(config.clone())
        .await
        .context("Failed to initialize notification service")?;

    // Create cancellation token for graceful shutdown
    let cancellation_token = CancellationToken::new();

    info!("Starting notification scheduler");
    let scheduler_task = service.scheduler().start(cancellation_token.clone());

    let app = service.router();

    let addr = SocketAddr::new(
        config
            .server
            .host
            .parse()
            .with_context(|| format!("Invalid host address: {}", config.server.host))?,
        config.server.port,
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to address {}", addr))?;

    info!("Notification service started successfully on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("Metrics: http://{}/metrics", addr);

    let shutdown_token = cancellation_token.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown...");
        shutdown_token.cancel();
    });

    if let Err(e) = server.await {
        error!("Server error: {}", e);
        cancellation_token.cancel();
    }

    if let Err(e) = scheduler_task.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }
    service.shutdown().await;

    info!("EDU-CORE Notification Service stopped gracefully");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(format: Option<&str>) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        Some("json") => registry.with(fmt::layer().json().with_target(true)).try_init(),
        _ => registry.with(fmt::layer().with_target(true)).try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialize tracing: {}", e))
}

/// Create CLI argument parser
fn create_cli() -> Command {
    Command::new("notification-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("EDU-CORE Notification Service - multi-channel notification dispatch")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .env("NOTIFICATION_CONFIG_FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Server host address"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("Server port"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["text", "json"])
                .default_value("text")
                .help("Log output format"),
        )
}

/// Load configuration from file and environment, then apply CLI overrides
fn load_config(matches: &ArgMatches) -> anyhow::Result<NotificationConfig> {
    let config_file = matches.get_one::<String>("config").map(String::as_str);
    if let Some(path) = config_file {
        info!("Loading configuration from file: {}", path);
    }

    let mut config = NotificationConfig::load(config_file).context("Failed to load configuration")?;

    if let Some(host) = matches.get_one::<String>("host") {
        config.server.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.server.port = *port;
    }

    Ok(config)
}

/// Wait for shutdown signals
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_cli() {
        let matches = create_cli()
            .try_get_matches_from(vec!["notification-server", "--port", "9090"])
            .unwrap();
        assert_eq!(matches.get_one::<u16>("port"), Some(&9090));
        assert_eq!(
            matches.get_one::<String>("log-format").map(String::as_str),
            Some("text")
        );
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let result = create_cli().try_get_matches_from(vec!["notification-server", "--port", "invalid"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_log_format_is_rejected() {
        let result =
            create_cli().try_get_matches_from(vec!["notification-server", "--log-format", "xml"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_with_overrides() {
        let matches = create_cli().get_matches_from(vec![
            "notification-server",
            "--host",
            "127.0.0.1",
            "--port",
            "9999",
        ]);

        let config = load_config(&matches).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9999);
    }
}
