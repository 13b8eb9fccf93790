//! Retry policy and the scheduler that re-admits failed events after backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::event::{Event, EventStatus};
use crate::queue::AdmissionQueue;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * factor^retry_count
    #[default]
    Exponential,
    /// Linear backoff: base * retry_count
    Linear,
}

/// Bus-wide retry policy. Handlers do not carry their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay unit the strategy scales
    pub base_delay: Duration,
    /// Growth factor for exponential backoff
    pub factor: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    /// `min(2^retry_count, 300)` seconds.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            factor: 1.0,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            factor,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before re-admitting an event whose retry count is `retry_count`
    /// (already incremented for the upcoming attempt).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base_ns = self.base_delay.as_nanos() as f64;
        let max_ns = self.max_delay.as_nanos() as f64;

        let delay_ns = match self.strategy {
            BackoffStrategy::Fixed => base_ns,
            BackoffStrategy::Exponential => {
                let exp = i32::try_from(retry_count).unwrap_or(i32::MAX);
                base_ns * self.factor.powi(exp)
            }
            BackoffStrategy::Linear => base_ns * f64::from(retry_count),
        };

        if !delay_ns.is_finite() || delay_ns >= max_ns {
            return self.max_delay;
        }
        Duration::from_nanos(delay_ns.max(0.0) as u64)
    }
}

/// Sleeps out the backoff for failed events and pushes them straight back onto
/// the queue, bypassing publish validation and the overflow policy.
///
/// One scheduler exists per bus run; cancelling its token abandons every
/// pending retry.
#[derive(Debug, Clone)]
pub(crate) struct RetryScheduler {
    queue: Arc<AdmissionQueue>,
    policy: RetryPolicy,
    running: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    token: CancellationToken,
}

impl RetryScheduler {
    pub(crate) fn new(
        queue: Arc<AdmissionQueue>,
        policy: RetryPolicy,
        running: Arc<AtomicBool>,
        pending: Arc<AtomicUsize>,
        token: CancellationToken,
    ) -> Self {
        Self {
            queue,
            policy,
            running,
            pending,
            token,
        }
    }

    pub(crate) fn schedule(&self, event: Event) {
        let delay = self.policy.delay_for(event.retry_count);
        debug!(
            event_id = %event.id,
            retry_count = event.retry_count,
            delay_ms = delay.as_millis() as u64,
            "scheduling event retry"
        );

        let queue = self.queue.clone();
        let running = self.running.clone();
        let pending = self.pending.clone();
        let token = self.token.clone();

        pending.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut event = event;
            tokio::select! {
                _ = token.cancelled() => {
                    trace!(event_id = %event.id, "retry abandoned by shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    if running.load(Ordering::SeqCst) {
                        event.status = EventStatus::Pending;
                        queue.requeue(event);
                    } else {
                        trace!(event_id = %event.id, "retry dropped: bus stopped");
                    }
                }
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_policy_doubles_seconds_up_to_five_minutes() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(8), Duration::from_secs(256));
        assert_eq!(policy.delay_for(9), Duration::from_secs(300));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            factor: 1.0,
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn scheduled_retry_lands_back_on_the_queue() {
        let queue = Arc::new(AdmissionQueue::new(4));
        let running = Arc::new(AtomicBool::new(true));
        let pending = Arc::new(AtomicUsize::new(0));
        let scheduler = RetryScheduler::new(
            queue.clone(),
            RetryPolicy::fixed(Duration::from_millis(5)),
            running,
            pending.clone(),
            CancellationToken::new(),
        );

        let mut event = Event::new(crate::EventType::OrderCreated, "sales");
        event.mark_retry();
        scheduler.schedule(event.clone());

        let requeued = queue.dequeue(Duration::from_secs(1)).await.unwrap();
        assert_eq!(requeued.id, event.id);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.status, EventStatus::Pending);
    }

    #[tokio::test]
    async fn cancelled_scheduler_abandons_pending_retries() {
        let queue = Arc::new(AdmissionQueue::new(4));
        let pending = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let scheduler = RetryScheduler::new(
            queue.clone(),
            RetryPolicy::fixed(Duration::from_secs(60)),
            Arc::new(AtomicBool::new(true)),
            pending.clone(),
            token.clone(),
        );

        scheduler.schedule(Event::new(crate::EventType::OrderCreated, "sales"));
        assert_eq!(pending.load(Ordering::SeqCst), 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while pending.load(Ordering::SeqCst) > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_cap(retry in 0u32..64, base_ms in 1u64..5_000, cap_s in 1u64..600) {
            let policy = RetryPolicy::exponential(
                Duration::from_millis(base_ms),
                2.0,
                Duration::from_secs(cap_s),
            );
            prop_assert!(policy.delay_for(retry) <= Duration::from_secs(cap_s));
        }

        #[test]
        fn exponential_delay_is_monotonic(retry in 0u32..40) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.delay_for(retry) <= policy.delay_for(retry + 1));
        }
    }
}
