//! In-process job queue ordered by run-at time

use super::{EnqueueOptions, Job, JobQueue};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    waiting: BTreeMap<(DateTime<Utc>, Uuid), Job>,
    failed: VecDeque<Job>,
}

pub struct MemoryJobQueue {
    inner: Mutex<Inner>,
    failed_retention: usize,
}

impl MemoryJobQueue {
    pub fn new(failed_retention: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            failed_retention: failed_retention.max(1),
        }
    }

    /// Snapshot of waiting jobs in run-at order
    pub fn waiting(&self) -> Vec<Job> {
        self.inner.lock().waiting.values().cloned().collect()
    }

    /// Most recent failure first
    pub fn failed(&self) -> Vec<Job> {
        self.inner.lock().failed.iter().cloned().collect()
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<Job> {
        let job = Job::new(job_type, payload, &options, Utc::now());
        debug!(job_id = %job.id, job_type = %job.job_type, run_at = %job.run_at, "Job enqueued");
        self.inner
            .lock()
            .waiting
            .insert((job.run_at, job.id), job.clone());
        Ok(job)
    }

    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let mut inner = self.inner.lock();
        let due: Vec<(DateTime<Utc>, Uuid)> = inner
            .waiting
            .range(..=(now, Uuid::max()))
            .take(limit)
            .map(|(key, _)| *key)
            .collect();

        Ok(due
            .into_iter()
            .filter_map(|key| inner.waiting.remove(&key))
            .map(|mut job| {
                job.attempts_made += 1;
                job
            })
            .collect())
    }

    async fn complete(&self, job: &Job) -> Result<()> {
        debug!(job_id = %job.id, "Job completed");
        Ok(())
    }

    async fn reschedule(&self, job: &Job, run_at: DateTime<Utc>) -> Result<()> {
        let mut job = job.clone();
        job.run_at = run_at;
        self.inner.lock().waiting.insert((run_at, job.id), job);
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<()> {
        let mut job = job.clone();
        job.last_error = Some(error.to_string());
        let mut inner = self.inner.lock();
        inner.failed.push_front(job);
        inner.failed.truncate(self.failed_retention);
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.inner.lock().waiting.len() as u64)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PROCESS_NOTIFICATION;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_delayed_job_is_not_due_early() {
        let queue = MemoryJobQueue::default();
        let options = EnqueueOptions::default().with_delay(Duration::from_secs(60));
        let job = queue
            .enqueue(PROCESS_NOTIFICATION, json!({}), options)
            .await
            .unwrap();

        assert!(queue.fetch_due(Utc::now(), 10).await.unwrap().is_empty());
        assert_eq!(queue.len().await.unwrap(), 1);

        let claimed = queue.fetch_due(job.run_at, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts_made, 1);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let queue = MemoryJobQueue::default();
        queue
            .enqueue(PROCESS_NOTIFICATION, json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(queue.fetch_due(later, 10).await.unwrap().len(), 1);
        assert!(queue.fetch_due(later, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reschedule_and_fail() {
        let queue = MemoryJobQueue::new(1);
        queue
            .enqueue(PROCESS_NOTIFICATION, json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let now = Utc::now() + chrono::Duration::seconds(1);
        let job = queue.fetch_due(now, 1).await.unwrap().remove(0);

        let retry_at = now + chrono::Duration::seconds(2);
        queue.reschedule(&job, retry_at).await.unwrap();
        assert!(queue.fetch_due(now, 1).await.unwrap().is_empty());

        let job = queue.fetch_due(retry_at, 1).await.unwrap().remove(0);
        assert_eq!(job.attempts_made, 2);

        queue.fail(&job, "boom").await.unwrap();
        queue.fail(&job, "boom again").await.unwrap();
        let failed = queue.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("boom again"));
    }
}
