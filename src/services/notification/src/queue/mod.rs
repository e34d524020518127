//! Delayed job queue with retry accounting
//!
//! Jobs are claimed by `fetch_due`, which bumps `attempts_made`. The worker in
//! `scheduler` decides between `complete`, `reschedule` and `fail`.

use crate::config::QueueConfig;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

pub mod memory;
pub mod redis_queue;

pub use memory::MemoryJobQueue;
pub use redis_queue::RedisJobQueue;

/// Job type that runs `process` for the notification in the payload.
pub const PROCESS_NOTIFICATION: &str = "process-notification";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: Value,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(
        job_type: impl Into<String>,
        payload: Value,
        options: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let delay = chrono::Duration::from_std(options.delay).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            payload,
            attempts_made: 0,
            max_attempts: options.attempts.max(1),
            backoff_base_ms: options.backoff_base.as_millis() as u64,
            run_at: now + delay,
            created_at: now,
            last_error: None,
        }
    }

    /// `base * 2^(attempt - 1)` for the attempt that just failed
    pub fn backoff_delay(&self) -> Duration {
        let exponent = self.attempts_made.saturating_sub(1).min(20);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << exponent))
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    pub fn notification_id(&self) -> Option<Uuid> {
        self.payload
            .get("notification_id")
            .and_then(Value::as_str)
            .and_then(|id| id.parse().ok())
    }

    pub(crate) fn score(&self) -> f64 {
        self.run_at.timestamp_millis() as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOptions {
    pub delay: Duration,
    pub attempts: u32,
    pub backoff_base: Duration,
}

impl EnqueueOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            delay: Duration::ZERO,
            attempts: config.attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job_type: &str, payload: Value, options: EnqueueOptions)
        -> Result<Job>;

    /// Claims up to `limit` jobs whose `run_at <= now`. A claimed job is
    /// handed to exactly one caller.
    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    async fn complete(&self, job: &Job) -> Result<()>;

    async fn reschedule(&self, job: &Job, run_at: DateTime<Utc>) -> Result<()>;

    /// Moves the job to the capped failed list
    async fn fail(&self, job: &Job, error: &str) -> Result<()>;

    /// Number of waiting jobs
    async fn len(&self) -> Result<u64>;

    async fn health_check(&self) -> Result<bool>;
}

/// Callback run by the worker for each claimed job.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options() -> EnqueueOptions {
        EnqueueOptions {
            delay: Duration::from_secs(90),
            attempts: 3,
            backoff_base: Duration::from_millis(2000),
        }
    }

    #[test]
    fn test_new_job_runs_after_delay() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let job = Job::new(PROCESS_NOTIFICATION, json!({ "notification_id": id }), &options(), now);

        assert_eq!(job.run_at, now + chrono::Duration::seconds(90));
        assert_eq!(job.notification_id(), Some(id));
        assert_eq!(job.attempts_made, 0);
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let mut job = Job::new(PROCESS_NOTIFICATION, json!({}), &options(), Utc::now());

        job.attempts_made = 1;
        assert_eq!(job.backoff_delay(), Duration::from_millis(2000));
        job.attempts_made = 2;
        assert_eq!(job.backoff_delay(), Duration::from_millis(4000));
        job.attempts_made = 3;
        assert_eq!(job.backoff_delay(), Duration::from_millis(8000));
        assert!(!job.has_attempts_left());
    }
}
