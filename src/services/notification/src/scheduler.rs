//! Notification scheduler module
//!
//! Background worker that drains the job queue:
//! - polls for due jobs on a fixed interval
//! - runs them with bounded concurrency
//! - retries retryable failures with exponential backoff
//! - discards jobs that can never succeed

use crate::config::QueueConfig;
use crate::error::Result;
use crate::metrics::{JobOutcome, NotificationMetrics};
use crate::queue::{Job, JobProcessor, JobQueue};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct NotificationScheduler {
    queue: Arc<dyn JobQueue>,
    processor: Arc<dyn JobProcessor>,
    poll_interval: Duration,
    fetch_batch_size: usize,
    concurrency: usize,
    metrics: Option<NotificationMetrics>,
}

impl NotificationScheduler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        processor: Arc<dyn JobProcessor>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            fetch_batch_size: config.fetch_batch_size.max(1),
            concurrency: config.worker_concurrency.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: NotificationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawns the polling loop; it exits once `shutdown` is cancelled.
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            concurrency = self.concurrency,
            "Notification scheduler started"
        );

        let mut ticker = interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!(error = %e, "Scheduler poll failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Notification scheduler stopping");
                    break;
                }
            }
        }
    }

    /// Claims every job due at `now` (up to the fetch batch size) and runs
    /// them. Returns how many jobs were handled.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let jobs = self.queue.fetch_due(now, self.fetch_batch_size).await?;
        let handled = jobs.len();

        if handled > 0 {
            debug!(jobs = handled, "Processing due jobs");
            stream::iter(jobs)
                .map(|job| self.execute(job))
                .buffer_unordered(self.concurrency)
                .collect::<Vec<_>>()
                .await;
        }

        if let Some(ref metrics) = self.metrics {
            match self.queue.len().await {
                Ok(depth) => metrics.set_queue_depth(depth),
                Err(e) => warn!(error = %e, "Failed to read queue depth"),
            }
        }

        Ok(handled)
    }

    async fn execute(&self, job: Job) -> JobOutcome {
        let outcome = match self.processor.handle(&job).await {
            Ok(()) => {
                self.settle(self.queue.complete(&job).await, &job);
                JobOutcome::Completed
            }
            Err(e) if !e.is_retryable() => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    error = %e,
                    "Job cannot succeed; discarding"
                );
                self.settle(self.queue.complete(&job).await, &job);
                JobOutcome::Discarded
            }
            Err(e) if job.has_attempts_left() => {
                let delay = job.backoff_delay();
                let run_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    retry_at = %run_at,
                    error = %e,
                    "Job failed; retrying"
                );
                self.settle(self.queue.reschedule(&job, run_at).await, &job);
                JobOutcome::Retried
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    attempts = job.attempts_made,
                    error = %e,
                    "Job failed permanently"
                );
                self.settle(self.queue.fail(&job, &e.to_string()).await, &job);
                JobOutcome::Failed
            }
        };

        if let Some(ref metrics) = self.metrics {
            metrics.record_job(outcome);
        }
        outcome
    }

    fn settle(&self, result: Result<()>, job: &Job) {
        if let Err(e) = result {
            error!(job_id = %job.id, error = %e, "Failed to update job state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotificationError;
    use crate::queue::{EnqueueOptions, MemoryJobQueue};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Returns the scripted results in order, then succeeds.
    struct Scripted {
        results: Mutex<Vec<Result<()>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(results: Vec<Result<()>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl JobProcessor for Scripted {
        async fn handle(&self, _job: &Job) -> Result<()> {
            *self.calls.lock() += 1;
            let mut results = self.results.lock();
            if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            }
        }
    }

    fn config() -> QueueConfig {
        QueueConfig {
            attempts: 2,
            backoff_base_ms: 1000,
            ..QueueConfig::default()
        }
    }

    async fn enqueue(queue: &MemoryJobQueue) {
        let options = EnqueueOptions {
            attempts: 2,
            backoff_base: Duration::from_millis(1000),
            ..EnqueueOptions::default()
        };
        queue
            .enqueue("process-notification", json!({}), options)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_success_completes_job() {
        let queue = Arc::new(MemoryJobQueue::default());
        enqueue(&queue).await;
        let processor = Scripted::new(vec![]);
        let scheduler = NotificationScheduler::new(queue.clone(), processor.clone(), &config());

        assert_eq!(scheduler.run_once(Utc::now()).await.unwrap(), 1);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert!(queue.failed().is_empty());
    }

    #[tokio::test]
    async fn test_retryable_error_is_rescheduled_then_failed() {
        let queue = Arc::new(MemoryJobQueue::default());
        enqueue(&queue).await;
        let processor = Scripted::new(vec![
            Err(NotificationError::database("connection reset")),
            Err(NotificationError::database("connection reset")),
        ]);
        let scheduler = NotificationScheduler::new(queue.clone(), processor.clone(), &config());

        scheduler.run_once(Utc::now()).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
        // backoff keeps it off the next immediate poll
        assert_eq!(scheduler.run_once(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::seconds(5);
        scheduler.run_once(later).await.unwrap();
        assert_eq!(*processor.calls.lock(), 2);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.failed().len(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_discarded() {
        let queue = Arc::new(MemoryJobQueue::default());
        enqueue(&queue).await;
        let processor = Scripted::new(vec![Err(NotificationError::not_found("notification"))]);
        let scheduler = NotificationScheduler::new(queue.clone(), processor.clone(), &config());

        scheduler.run_once(Utc::now()).await.unwrap();
        assert_eq!(*processor.calls.lock(), 1);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert!(queue.failed().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let queue = Arc::new(MemoryJobQueue::default());
        let scheduler = NotificationScheduler::new(queue, Scripted::new(vec![]), &config());
        let token = CancellationToken::new();
        let handle = scheduler.start(token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
