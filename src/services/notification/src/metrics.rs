//! Prometheus metrics for the dispatch engine
//!
//! - processed notifications by final status
//! - deliveries by channel and outcome
//! - dispatch duration
//! - queue job outcomes and depth

use crate::config::MetricsConfig;
use crate::error::{NotificationError, Result};
use edu_core_shared::types::{ChannelKind, NotificationStatus};

use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Outcome label for a queue job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Discarded,
    Retried,
    Failed,
}

impl JobOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Discarded => "discarded",
            JobOutcome::Retried => "retried",
            JobOutcome::Failed => "failed",
        }
    }
}

#[derive(Clone)]
pub struct NotificationMetrics {
    registry: Arc<Registry>,
    notifications_processed: IntCounterVec,
    deliveries: IntCounterVec,
    dispatch_duration: Histogram,
    queue_jobs: IntCounterVec,
    queue_depth: IntGauge,
}

fn metric_error(name: &str, e: prometheus::Error) -> NotificationError {
    NotificationError::internal(format!("Failed to create {} metric: {}", name, e))
}

impl NotificationMetrics {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        info!(namespace = %config.namespace, "Initializing notification metrics");

        let registry = Registry::new();

        let notifications_processed = IntCounterVec::new(
            Opts::new(
                "notifications_processed_total",
                "Notifications that finished processing, by final status",
            )
            .namespace(&config.namespace),
            &["status"],
        )
        .map_err(|e| metric_error("notifications_processed_total", e))?;

        let deliveries = IntCounterVec::new(
            Opts::new(
                "deliveries_total",
                "Per-recipient delivery attempts by channel and outcome",
            )
            .namespace(&config.namespace),
            &["channel", "outcome"],
        )
        .map_err(|e| metric_error("deliveries_total", e))?;

        let dispatch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dispatch_duration_seconds",
                "Time spent processing one notification",
            )
            .namespace(&config.namespace)
            .buckets(config.histogram_buckets.clone()),
        )
        .map_err(|e| metric_error("dispatch_duration_seconds", e))?;

        let queue_jobs = IntCounterVec::new(
            Opts::new("queue_jobs_total", "Queue jobs handled, by outcome")
                .namespace(&config.namespace),
            &["outcome"],
        )
        .map_err(|e| metric_error("queue_jobs_total", e))?;

        let queue_depth = IntGauge::with_opts(
            Opts::new("queue_depth", "Jobs waiting in the queue").namespace(&config.namespace),
        )
        .map_err(|e| metric_error("queue_depth", e))?;

        registry
            .register(Box::new(notifications_processed.clone()))
            .map_err(|e| metric_error("notifications_processed_total", e))?;
        registry
            .register(Box::new(deliveries.clone()))
            .map_err(|e| metric_error("deliveries_total", e))?;
        registry
            .register(Box::new(dispatch_duration.clone()))
            .map_err(|e| metric_error("dispatch_duration_seconds", e))?;
        registry
            .register(Box::new(queue_jobs.clone()))
            .map_err(|e| metric_error("queue_jobs_total", e))?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(|e| metric_error("queue_depth", e))?;

        #[cfg(target_os = "linux")]
        registry
            .register(Box::new(
                prometheus::process_collector::ProcessCollector::for_self(),
            ))
            .map_err(|e| metric_error("process", e))?;

        Ok(Self {
            registry: Arc::new(registry),
            notifications_processed,
            deliveries,
            dispatch_duration,
            queue_jobs,
            queue_depth,
        })
    }

    pub fn record_processed(&self, status: NotificationStatus) {
        self.notifications_processed
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn record_deliveries(&self, channel: ChannelKind, delivered: u64, failed: u64) {
        self.deliveries
            .with_label_values(&[channel.as_str(), "delivered"])
            .inc_by(delivered);
        self.deliveries
            .with_label_values(&[channel.as_str(), "failed"])
            .inc_by(failed);
    }

    pub fn record_job(&self, outcome: JobOutcome) {
        self.queue_jobs.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    pub fn start_timer(&self) -> DispatchTimer {
        DispatchTimer {
            histogram: self.dispatch_duration.clone(),
            started: Instant::now(),
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Text exposition format for `GET /metrics`
    pub fn export(&self) -> Result<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .map_err(|e| NotificationError::internal(format!("Failed to encode metrics: {}", e)))
    }
}

/// Observes the dispatch histogram when dropped
pub struct DispatchTimer {
    histogram: Histogram,
    started: Instant,
}

impl Drop for DispatchTimer {
    fn drop(&mut self) {
        self.histogram
            .observe(self.started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> MetricsConfig {
        MetricsConfig {
            enabled: true,
            namespace: "test_notifications".to_string(),
            histogram_buckets: vec![0.1, 1.0],
        }
    }

    #[test]
    fn test_export_contains_recorded_series() {
        let metrics = NotificationMetrics::new(&create_test_config()).unwrap();
        metrics.record_processed(NotificationStatus::PartiallySent);
        metrics.record_deliveries(ChannelKind::Sms, 2, 1);
        metrics.record_job(JobOutcome::Retried);
        metrics.set_queue_depth(4);
        drop(metrics.start_timer());

        let text = metrics.export().unwrap();
        assert!(text.contains("test_notifications_notifications_processed_total{status=\"PARTIALLY_SENT\"} 1"));
        assert!(text.contains("test_notifications_deliveries_total{channel=\"SMS\",outcome=\"failed\"} 1"));
        assert!(text.contains("test_notifications_queue_jobs_total{outcome=\"retried\"} 1"));
        assert!(text.contains("test_notifications_queue_depth 4"));
        assert!(text.contains("test_notifications_dispatch_duration_seconds_count 1"));
    }

    #[test]
    fn test_independent_registries() {
        let first = NotificationMetrics::new(&create_test_config()).unwrap();
        let second = NotificationMetrics::new(&create_test_config()).unwrap();
        first.record_processed(NotificationStatus::Sent);
        assert!(!second.export().unwrap().contains("status=\"SENT\""));
    }
}
