//! Strategy slots invoked by the bus's periodic tasks.
//!
//! The bus ships with inert defaults. Deployments that want dead-letter
//! alerting/archival or real webhook delivery plug in their own policy via
//! [`EventBus::with_policies`](crate::EventBus::with_policies).

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::history::DeadLetterEntry;
use crate::subscription::{DeliveryOutcome, WebhookBatch};

/// Periodic dead-letter housekeeping.
#[async_trait]
pub trait DeadLetterPolicy: Send + Sync {
    /// Called every `dead_letter_interval` with a snapshot of the buffer,
    /// oldest first.
    async fn review(&self, entries: &[DeadLetterEntry]) -> anyhow::Result<()>;
}

/// Keeps dead letters in memory and reports the depth.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetainDeadLetters;

#[async_trait]
impl DeadLetterPolicy for RetainDeadLetters {
    async fn review(&self, entries: &[DeadLetterEntry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            debug!("dead-letter buffer empty");
        } else {
            warn!(
                dead_letter_size = entries.len(),
                oldest = %entries[0].dead_lettered_at,
                "dead-lettered events awaiting attention"
            );
        }
        Ok(())
    }
}

/// Periodic webhook delivery.
#[async_trait]
pub trait WebhookDeliveryPolicy: Send + Sync {
    /// Called every `webhook_interval` with the events admitted since the
    /// previous tick, grouped per enabled subscription. Skipped when nothing
    /// is owed.
    ///
    /// Returned outcomes are applied to the subscriptions' delivery counters.
    /// Events left out of the outcomes are not retried.
    async fn deliver(&self, batches: &[WebhookBatch]) -> anyhow::Result<Vec<DeliveryOutcome>>;
}

/// Drops owed events; subscriptions are only stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWebhookDelivery;

#[async_trait]
impl WebhookDeliveryPolicy for NoopWebhookDelivery {
    async fn deliver(&self, batches: &[WebhookBatch]) -> anyhow::Result<Vec<DeliveryOutcome>> {
        debug!(
            subscriptions = batches.len(),
            events = batches.iter().map(|b| b.events.len()).sum::<usize>(),
            "webhook delivery not configured"
        );
        Ok(Vec::new())
    }
}
