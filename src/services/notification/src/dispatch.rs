//! Batched delivery of one channel to a recipient list

use crate::channels::{recipient_address, ChannelAdapter};
use crate::error::Result;
use crate::metrics::NotificationMetrics;
use crate::templates::RenderedContent;
use crate::tracker::DeliveryTracker;
use chrono::Utc;
use edu_core_shared::types::{DeliveryLog, Notification, Recipient, RecipientOutcome};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ChannelDispatcher {
    tracker: DeliveryTracker,
    batch_size: usize,
    metrics: Option<NotificationMetrics>,
}

impl ChannelDispatcher {
    pub fn new(tracker: DeliveryTracker, batch_size: usize) -> Self {
        Self {
            tracker,
            batch_size: batch_size.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: NotificationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sends to every recipient, one batch at a time. Sends inside a batch run
    /// concurrently. A failed send becomes a FAILED log row and never aborts the
    /// batch; only a failure to persist the log rows is returned as an error.
    pub async fn dispatch(
        &self,
        adapter: &Arc<dyn ChannelAdapter>,
        notification: &Notification,
        content: &RenderedContent,
        recipients: &[&Recipient],
    ) -> Result<Vec<RecipientOutcome>> {
        let channel = adapter.kind();
        let mut outcomes = Vec::with_capacity(recipients.len());

        for (index, batch) in recipients.chunks(self.batch_size).enumerate() {
            let attempts = join_all(
                batch
                    .iter()
                    .map(|recipient| send_one(adapter.as_ref(), recipient, content, notification)),
            )
            .await;

            let (batch_outcomes, logs): (Vec<_>, Vec<_>) = attempts.into_iter().unzip();
            self.tracker.record_attempts(&logs).await?;

            let delivered = batch_outcomes.iter().filter(|o| o.success).count() as u64;
            let failed = batch_outcomes.len() as u64 - delivered;
            if let Some(ref metrics) = self.metrics {
                metrics.record_deliveries(channel, delivered, failed);
            }
            debug!(
                notification_id = %notification.id,
                channel = %channel,
                batch = index,
                delivered,
                failed,
                "Batch dispatched"
            );
            outcomes.extend(batch_outcomes);
        }

        Ok(outcomes)
    }
}

async fn send_one(
    adapter: &dyn ChannelAdapter,
    recipient: &Recipient,
    content: &RenderedContent,
    notification: &Notification,
) -> (RecipientOutcome, DeliveryLog) {
    let channel = adapter.kind();

    let Some(address) = recipient_address(channel, recipient) else {
        let error = format!("recipient has no {} address", channel);
        return (
            RecipientOutcome {
                user_id: recipient.id,
                success: false,
                error: Some(error.clone()),
            },
            DeliveryLog::failed(
                notification.id,
                recipient.id,
                channel,
                recipient.id.to_string(),
                error,
                Utc::now(),
            ),
        );
    };

    match adapter.send(&address, recipient, content, notification).await {
        Ok(receipt) => (
            RecipientOutcome {
                user_id: recipient.id,
                success: true,
                error: None,
            },
            DeliveryLog::delivered(
                notification.id,
                recipient.id,
                channel,
                address,
                receipt.message_id,
                receipt.response,
                Utc::now(),
            ),
        ),
        Err(e) => {
            warn!(
                notification_id = %notification.id,
                channel = %channel,
                user_id = %recipient.id,
                error = %e,
                "Delivery failed"
            );
            let error = e.to_string();
            (
                RecipientOutcome {
                    user_id: recipient.id,
                    success: false,
                    error: Some(error.clone()),
                },
                DeliveryLog::failed(notification.id, recipient.id, channel, address, error, Utc::now()),
            )
        }
    }
}
