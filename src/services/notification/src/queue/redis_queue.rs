//! Redis-backed job queue
//!
//! Layout under the configured key prefix:
//! - `jobs:due`        sorted set of waiting job ids scored by run-at (epoch millis)
//! - `jobs:processing` sorted set of claimed job ids scored by lease deadline
//! - `jobs:data`       hash of job id to job JSON
//! - `jobs:failed`     capped list of failed job JSON, newest first
//!
//! Claiming runs as one Lua script: expired leases go back to `jobs:due`,
//! then due ids move to `jobs:processing`. A worker that dies mid-job leaves
//! its id in `jobs:processing` until the lease runs out, after which the job
//! is handed out again.

use super::{EnqueueOptions, Job, JobQueue};
use crate::config::{QueueConfig, RedisConfig};
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// KEYS: due, processing. ARGV: now, limit, lease deadline.
const CLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('ZADD', KEYS[1], ARGV[1], id)
end
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('ZADD', KEYS[2], ARGV[3], id)
end
return ids
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    due: String,
    processing: String,
    data: String,
    failed: String,
}

impl QueueKeys {
    fn new(prefix: &str) -> Self {
        Self {
            due: format!("{}jobs:due", prefix),
            processing: format!("{}jobs:processing", prefix),
            data: format!("{}jobs:data", prefix),
            failed: format!("{}jobs:failed", prefix),
        }
    }
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> i64 {
    let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_add(lease_ms)
}

pub struct RedisJobQueue {
    connection: ConnectionManager,
    keys: QueueKeys,
    claim_script: Script,
    lease: Duration,
    failed_retention: usize,
}

impl RedisJobQueue {
    pub async fn connect(redis: &RedisConfig, queue: &QueueConfig) -> Result<Self> {
        let client = Client::open(redis.url.as_str())?;
        let connection = tokio::time::timeout(
            Duration::from_secs(redis.connection_timeout_seconds),
            ConnectionManager::new(client),
        )
        .await??;

        info!(prefix = %redis.key_prefix, "Connected to Redis job queue");
        Ok(Self {
            connection,
            keys: QueueKeys::new(&redis.key_prefix),
            claim_script: Script::new(CLAIM_SCRIPT),
            lease: Duration::from_millis(queue.lease_ms.max(1)),
            failed_retention: queue.failed_retention.max(1),
        })
    }

    /// Claimed jobs whose lease has not yet run out
    pub async fn in_flight(&self) -> Result<u64> {
        let count: u64 = self.connection.clone().zcard(&self.keys.processing).await?;
        Ok(count)
    }

    /// Store the body and (re)queue the id, releasing any lease on it.
    async fn store(&self, job: &Job) -> Result<()> {
        let body = serde_json::to_string(job)?;
        let id = job.id.to_string();
        redis::pipe()
            .atomic()
            .hset(&self.keys.data, &id, body)
            .ignore()
            .zrem(&self.keys.processing, &id)
            .ignore()
            .zadd(&self.keys.due, &id, job.score())
            .ignore()
            .query_async::<_, ()>(&mut self.connection.clone())
            .await?;
        Ok(())
    }

    /// Drop the job from every index and push its body onto the capped
    /// failed list.
    async fn bury(&self, id: &str, body: String) -> Result<()> {
        let keep = isize::try_from(self.failed_retention)
            .map_err(|_| NotificationError::config("failed_retention is too large"))?;

        redis::pipe()
            .atomic()
            .hdel(&self.keys.data, id)
            .ignore()
            .zrem(&self.keys.processing, id)
            .ignore()
            .zrem(&self.keys.due, id)
            .ignore()
            .lpush(&self.keys.failed, body)
            .ignore()
            .ltrim(&self.keys.failed, 0, keep - 1)
            .ignore()
            .query_async::<_, ()>(&mut self.connection.clone())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<Job> {
        let job = Job::new(job_type, payload, &options, Utc::now());
        self.store(&job).await?;
        debug!(job_id = %job.id, job_type = %job.job_type, run_at = %job.run_at, "Job enqueued");
        Ok(job)
    }

    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = self
            .claim_script
            .key(&self.keys.due)
            .key(&self.keys.processing)
            .arg(now.timestamp_millis())
            .arg(limit)
            .arg(lease_deadline(now, self.lease))
            .invoke_async(&mut conn)
            .await?;

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let body: Option<String> = conn.hget(&self.keys.data, &id).await?;
            let Some(body) = body else {
                warn!(job_id = %id, "Due job has no stored body; dropping");
                let _: () = conn.zrem(&self.keys.processing, &id).await?;
                continue;
            };

            let mut job: Job = match serde_json::from_str(&body) {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Unreadable job body; moving to failed list");
                    self.bury(&id, body).await?;
                    continue;
                }
            };
            job.attempts_made += 1;
            let _: () = conn
                .hset(&self.keys.data, &id, serde_json::to_string(&job)?)
                .await?;
            claimed.push(job);
        }
        Ok(claimed)
    }

    async fn complete(&self, job: &Job) -> Result<()> {
        let id = job.id.to_string();
        redis::pipe()
            .atomic()
            .hdel(&self.keys.data, &id)
            .ignore()
            .zrem(&self.keys.processing, &id)
            .ignore()
            .query_async::<_, ()>(&mut self.connection.clone())
            .await?;
        Ok(())
    }

    async fn reschedule(&self, job: &Job, run_at: DateTime<Utc>) -> Result<()> {
        let mut job = job.clone();
        job.run_at = run_at;
        self.store(&job).await
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<()> {
        let mut job = job.clone();
        job.last_error = Some(error.to_string());
        let body = serde_json::to_string(&job)?;
        self.bury(&job.id.to_string(), body).await
    }

    async fn len(&self) -> Result<u64> {
        let count: u64 = self.connection.clone().zcard(&self.keys.due).await?;
        Ok(count)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(redis::cmd("PING")
            .query_async::<_, String>(&mut self.connection.clone())
            .await
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PROCESS_NOTIFICATION;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_keys_share_prefix() {
        assert_eq!(
            QueueKeys::new("notification:"),
            QueueKeys {
                due: "notification:jobs:due".to_string(),
                processing: "notification:jobs:processing".to_string(),
                data: "notification:jobs:data".to_string(),
                failed: "notification:jobs:failed".to_string(),
            }
        );
    }

    #[test]
    fn test_lease_deadline_adds_lease_to_now() {
        let now = Utc.with_ymd_and_hms(2024, 3, 13, 8, 0, 0).unwrap();
        assert_eq!(
            lease_deadline(now, Duration::from_secs(300)),
            now.timestamp_millis() + 300_000
        );
        assert_eq!(lease_deadline(now, Duration::MAX), i64::MAX);
    }

    async fn live_queue(failed_retention: usize) -> RedisJobQueue {
        let redis = RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            key_prefix: format!("test:{}:", Uuid::new_v4()),
            connection_timeout_seconds: 2,
        };
        let queue = QueueConfig {
            lease_ms: 60_000,
            failed_retention,
            ..QueueConfig::default()
        };
        RedisJobQueue::connect(&redis, &queue).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_claimed_job_returns_after_lease_expires() {
        let queue = live_queue(10).await;
        let job = queue
            .enqueue(PROCESS_NOTIFICATION, json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let now = Utc::now() + chrono::Duration::seconds(1);
        let claimed = queue.fetch_due(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts_made, 1);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.in_flight().await.unwrap(), 1);

        // worker vanished without settling; nothing is handed out during the lease
        assert!(queue.fetch_due(now, 10).await.unwrap().is_empty());

        let after_lease = now + chrono::Duration::seconds(61);
        let reclaimed = queue.fetch_due(after_lease, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, job.id);
        assert_eq!(reclaimed[0].attempts_made, 2);

        queue.complete(&reclaimed[0]).await.unwrap();
        assert_eq!(queue.in_flight().await.unwrap(), 0);
        let later = after_lease + chrono::Duration::seconds(120);
        assert!(queue.fetch_due(later, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_reschedule_releases_lease() {
        let queue = live_queue(10).await;
        queue
            .enqueue(PROCESS_NOTIFICATION, json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let now = Utc::now() + chrono::Duration::seconds(1);
        let claimed = queue.fetch_due(now, 10).await.unwrap();
        queue
            .reschedule(&claimed[0], now + chrono::Duration::seconds(5))
            .await
            .unwrap();

        assert_eq!(queue.in_flight().await.unwrap(), 0);
        assert_eq!(queue.len().await.unwrap(), 1);
        let retried = queue
            .fetch_due(now + chrono::Duration::seconds(5), 10)
            .await
            .unwrap();
        assert_eq!(retried[0].attempts_made, 2);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_unreadable_bodies_respect_failed_cap() {
        let queue = live_queue(2).await;
        let mut conn = queue.connection.clone();
        let now = Utc::now();
        for n in 0..3 {
            let id = format!("broken-{}", n);
            let _: () = conn.hset(&queue.keys.data, &id, "not json").await.unwrap();
            let _: () = conn
                .zadd(&queue.keys.due, &id, now.timestamp_millis())
                .await
                .unwrap();
        }

        assert!(queue.fetch_due(now, 10).await.unwrap().is_empty());

        let failed: u64 = conn.llen(&queue.keys.failed).await.unwrap();
        assert_eq!(failed, 2);
        assert_eq!(queue.in_flight().await.unwrap(), 0);
    }
}
