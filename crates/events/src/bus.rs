//! The event bus facade.
//!
//! [`EventBus`] is a cheap, cloneable handle. Producers call
//! [`publish`](EventBus::publish), consumers call
//! [`subscribe`](EventBus::subscribe); between them sit the admission queue,
//! a pool of dispatcher workers, the retry scheduler, and bounded history
//! buffers used for statistics, health, replay and dead-letter inspection.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use erpbus_core::{EventId, HandlerId, SubscriptionId, UserId};

use crate::config::BusConfig;
use crate::dispatcher::{Dispatcher, InFlight, ProcessingEntry};
use crate::error::PublishError;
use crate::event::{Event, EventPriority, EventType};
use crate::handler::{HandlerInfo, HandlerRegistration};
use crate::history::{DeadLetterEntry, EventSummary, FailedEvent, FailureReason, History};
use crate::policy::{DeadLetterPolicy, NoopWebhookDelivery, RetainDeadLetters, WebhookDeliveryPolicy};
use crate::queue::{Admission, AdmissionQueue, QueueFull};
use crate::registry::HandlerRegistry;
use crate::retry::RetryScheduler;
use crate::stats::{AggregatedStats, Aggregates, BusStatistics, Counters, HealthReport};
use crate::subscription::{SubscriptionRegistry, WebhookSubscription};

pub const USER_EVENT_SOURCE: &str = "user_service";
pub const SYSTEM_EVENT_SOURCE: &str = "system";
pub const AUDIT_EVENT_SOURCE: &str = "audit_service";
pub const SECURITY_EVENT_SOURCE: &str = "security_service";

/// Window used for rolling performance figures.
const PERFORMANCE_WINDOW_MINUTES: i64 = 5;

struct Lifecycle {
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    started_at: Instant,
}

struct Shared {
    config: BusConfig,
    queue: Arc<AdmissionQueue>,
    registry: Arc<HandlerRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    history: Arc<History>,
    counters: Arc<Counters>,
    in_flight: Arc<InFlight>,
    aggregates: Arc<Aggregates>,
    running: Arc<AtomicBool>,
    pending_retries: Arc<AtomicUsize>,
    dead_letter_policy: Arc<dyn DeadLetterPolicy>,
    webhook_policy: Arc<dyn WebhookDeliveryPolicy>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

/// In-process publish/subscribe bus with asynchronous dispatch.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("running", &self.is_running())
            .field("queue_size", &self.shared.queue.len())
            .field("handlers", &self.shared.registry.len())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self::with_policies(
            config,
            Arc::new(RetainDeadLetters),
            Arc::new(NoopWebhookDelivery),
        )
    }

    /// Build a bus with custom dead-letter and webhook strategies.
    pub fn with_policies(
        config: BusConfig,
        dead_letter_policy: Arc<dyn DeadLetterPolicy>,
        webhook_policy: Arc<dyn WebhookDeliveryPolicy>,
    ) -> Self {
        let shared = Shared {
            queue: Arc::new(AdmissionQueue::new(config.max_queue_size)),
            registry: Arc::new(HandlerRegistry::new(config.default_handler_timeout)),
            subscriptions: Arc::new(SubscriptionRegistry::new(config.buffers.webhook_outbox)),
            history: Arc::new(History::new(&config.buffers)),
            counters: Arc::new(Counters::default()),
            in_flight: Arc::new(InFlight::default()),
            aggregates: Arc::new(Aggregates::default()),
            running: Arc::new(AtomicBool::new(false)),
            pending_retries: Arc::new(AtomicUsize::new(0)),
            dead_letter_policy,
            webhook_policy,
            lifecycle: Mutex::new(None),
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the workers and periodic tasks, then announce `system.startup`.
    ///
    /// Returns `false` if the bus is already running.
    pub async fn start(&self) -> bool {
        let shared = &self.shared;
        {
            let mut lifecycle = shared.lifecycle.lock();
            if lifecycle.is_some() {
                warn!("event bus already running");
                return false;
            }

            let token = CancellationToken::new();
            shared.running.store(true, Ordering::SeqCst);

            let workers = self
                .dispatcher(token.child_token())
                .spawn_workers(shared.config.worker_count.max(1), &token);
            let background = vec![
                self.spawn_stats_task(&token),
                self.spawn_dead_letter_task(&token),
                self.spawn_webhook_task(&token),
            ];

            *lifecycle = Some(Lifecycle {
                token,
                workers,
                background,
                started_at: Instant::now(),
            });
        }

        info!(
            workers = shared.config.worker_count,
            max_queue_size = shared.config.max_queue_size,
            "event bus started"
        );
        self.publish_system_event(
            EventType::SystemStartup,
            json!({
                "worker_count": shared.config.worker_count,
                "max_queue_size": shared.config.max_queue_size,
                "enable_dead_letter": shared.config.enable_dead_letter,
            }),
        );
        true
    }

    /// Announce `system.shutdown`, stop accepting events, and wait for the
    /// workers and periodic tasks to finish.
    ///
    /// In-flight events complete; queued events stay queued and pending
    /// retries are abandoned. The `system.shutdown` event is admitted (it
    /// shows up in history and `events_published`) but joins the queued
    /// events: handlers only see it if the bus is started again. Returns
    /// `false` if the bus was not running.
    pub async fn stop(&self) -> bool {
        if self.shared.lifecycle.lock().is_none() {
            return false;
        }

        self.publish_system_event(
            EventType::SystemShutdown,
            json!({ "queue_size": self.shared.queue.len() }),
        );

        let Some(lifecycle) = self.shared.lifecycle.lock().take() else {
            return false;
        };
        self.shared.running.store(false, Ordering::SeqCst);
        let pending_retries = self.shared.pending_retries.load(Ordering::SeqCst);
        lifecycle.token.cancel();

        for handle in lifecycle.workers.into_iter().chain(lifecycle.background) {
            if let Err(err) = handle.await {
                error!(error = %err, "event bus task ended abnormally");
            }
        }

        info!(
            uptime_secs = lifecycle.started_at.elapsed().as_secs(),
            queued_events = self.shared.queue.len(),
            abandoned_retries = pending_retries,
            "event bus stopped"
        );
        true
    }

    fn dispatcher(&self, retry_token: CancellationToken) -> Dispatcher {
        let shared = &self.shared;
        Dispatcher {
            queue: shared.queue.clone(),
            registry: shared.registry.clone(),
            history: shared.history.clone(),
            counters: shared.counters.clone(),
            in_flight: shared.in_flight.clone(),
            retries: RetryScheduler::new(
                shared.queue.clone(),
                shared.config.retry.clone(),
                shared.running.clone(),
                shared.pending_retries.clone(),
                retry_token,
            ),
            enable_dead_letter: shared.config.enable_dead_letter,
            poll_interval: shared.config.poll_interval,
        }
    }

    fn spawn_stats_task(&self, token: &CancellationToken) -> JoinHandle<()> {
        let registry = self.shared.registry.clone();
        let subscriptions = self.shared.subscriptions.clone();
        let history = self.shared.history.clone();
        let aggregates = self.shared.aggregates.clone();

        spawn_periodic("stats", token.clone(), self.shared.config.stats_interval, move || {
            let registry = registry.clone();
            let subscriptions = subscriptions.clone();
            let history = history.clone();
            let aggregates = aggregates.clone();
            async move {
                let stats = aggregate(&registry, &subscriptions, &history);
                debug!(
                    handlers = stats.handlers_registered,
                    events_per_minute = stats.events_per_minute,
                    avg_processing_time_ms = stats.avg_processing_time_ms,
                    "bus statistics aggregated"
                );
                aggregates.set(stats);
            }
        })
    }

    fn spawn_dead_letter_task(&self, token: &CancellationToken) -> JoinHandle<()> {
        let history = self.shared.history.clone();
        let policy = self.shared.dead_letter_policy.clone();

        spawn_periodic(
            "dead_letter",
            token.clone(),
            self.shared.config.dead_letter_interval,
            move || {
                let history = history.clone();
                let policy = policy.clone();
                async move {
                    let entries = history.dead_letters.snapshot();
                    if let Err(err) = policy.review(&entries).await {
                        error!(error = %err, "dead-letter policy failed");
                    }
                }
            },
        )
    }

    fn spawn_webhook_task(&self, token: &CancellationToken) -> JoinHandle<()> {
        let subscriptions = self.shared.subscriptions.clone();
        let policy = self.shared.webhook_policy.clone();

        spawn_periodic(
            "webhook",
            token.clone(),
            self.shared.config.webhook_interval,
            move || {
                let subscriptions = subscriptions.clone();
                let policy = policy.clone();
                async move {
                    let batches = subscriptions.take_batches();
                    if batches.is_empty() {
                        return;
                    }
                    match policy.deliver(&batches).await {
                        Ok(outcomes) => {
                            let recorded = subscriptions.record_outcomes(&outcomes);
                            let failed = outcomes.iter().filter(|o| !o.success).count();
                            debug!(
                                batches = batches.len(),
                                recorded,
                                failed,
                                "webhook deliveries recorded"
                            );
                        }
                        Err(err) => error!(error = %err, "webhook delivery policy failed"),
                    }
                }
            },
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Producers
    // ─────────────────────────────────────────────────────────────────────────

    /// Offer an event for asynchronous processing. `true` means admitted.
    pub fn publish(&self, event: Event) -> bool {
        self.try_publish(event).is_ok()
    }

    /// Like [`publish`](Self::publish), but reports why an event was rejected.
    ///
    /// Every offered event is kept in the replay buffer. Rejected events are
    /// recorded in the failed-events buffer.
    pub fn try_publish(&self, event: Event) -> Result<EventId, PublishError> {
        let shared = &self.shared;
        shared.history.replay.push(event.clone());

        if !self.is_running() {
            return Err(self.reject(event, FailureReason::BusNotRunning, PublishError::NotRunning));
        }
        if let Err(err) = event.validate() {
            return Err(self.reject(event, FailureReason::ValidationFailed, err.into()));
        }

        let id = event.id;
        let summary = EventSummary::from(&event);
        let outbound = shared
            .subscriptions
            .wants_any(&event)
            .then(|| event.clone());

        match shared.queue.try_admit(event) {
            Ok(admission) => {
                if let Admission::AdmittedWithEviction(evicted) = admission {
                    warn!(
                        event_id = %id,
                        evicted_event_id = %evicted.id,
                        evicted_priority = %evicted.priority,
                        "queue full; evicted lower-priority event"
                    );
                    shared.history.record_failure(
                        *evicted,
                        FailureReason::EvictedForPriority,
                        Some(format!("evicted to admit {id}")),
                    );
                }
                shared.counters.record_published();
                if let Some(outbound) = outbound {
                    shared.subscriptions.enqueue(outbound);
                }
                debug!(
                    event_id = %id,
                    event_type = %summary.event_type,
                    priority = %summary.priority,
                    "event published"
                );
                shared.history.events.push(summary);
                Ok(id)
            }
            Err(QueueFull(event)) => Err(self.reject(
                *event,
                FailureReason::QueueOverflow,
                PublishError::QueueOverflow {
                    capacity: shared.queue.capacity(),
                },
            )),
        }
    }

    fn reject(&self, event: Event, reason: FailureReason, err: PublishError) -> PublishError {
        warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            reason = reason.as_str(),
            "event rejected"
        );
        self.shared.counters.record_rejected();
        self.shared
            .history
            .record_failure(event, reason, Some(err.to_string()));
        err
    }

    pub fn publish_user_event(&self, event_type: EventType, user_id: UserId, data: Value) -> bool {
        self.publish(
            Event::new(event_type, USER_EVENT_SOURCE)
                .with_user(user_id)
                .with_data(data),
        )
    }

    pub fn publish_system_event(&self, event_type: EventType, data: Value) -> bool {
        self.publish(Event::new(event_type, SYSTEM_EVENT_SOURCE).with_data(data))
    }

    /// Publish an `audit.log` event recording `action`.
    pub fn publish_audit_event(
        &self,
        action: impl Into<String>,
        user_id: Option<UserId>,
        data: Value,
    ) -> bool {
        let mut event = Event::new(EventType::AuditLog, AUDIT_EVENT_SOURCE).with_data(data);
        event
            .data
            .insert("action".to_string(), Value::String(action.into()));
        event.user_id = user_id;
        self.publish(event)
    }

    /// Publish a security event, `High` priority unless told otherwise.
    pub fn publish_security_event(
        &self,
        event_type: EventType,
        data: Value,
        priority: Option<EventPriority>,
    ) -> bool {
        self.publish(
            Event::new(event_type, SECURITY_EVENT_SOURCE)
                .with_data(data)
                .with_priority(priority.unwrap_or(EventPriority::High)),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Consumers
    // ─────────────────────────────────────────────────────────────────────────

    pub fn subscribe(&self, registration: HandlerRegistration) -> HandlerId {
        let handler = self.shared.registry.register(registration);
        info!(
            handler_id = %handler.id,
            handler = %handler.name,
            event_types = ?handler.event_types.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            priority = handler.priority,
            "handler subscribed"
        );
        handler.id
    }

    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let removed = self.shared.registry.unregister(id);
        if removed {
            info!(handler_id = %id, "handler unsubscribed");
        }
        removed
    }

    pub fn handler_info(&self, id: HandlerId) -> Option<HandlerInfo> {
        self.shared.registry.get(id).map(|h| h.info())
    }

    pub fn handlers(&self) -> Vec<HandlerInfo> {
        self.shared.registry.snapshot()
    }

    pub fn set_handler_enabled(&self, id: HandlerId, enabled: bool) -> bool {
        self.shared.registry.set_enabled(id, enabled)
    }

    pub fn add_webhook_subscription(&self, subscription: WebhookSubscription) -> SubscriptionId {
        let id = self.shared.subscriptions.add(subscription);
        info!(subscription_id = %id, "webhook subscription added");
        id
    }

    pub fn remove_webhook_subscription(&self, id: SubscriptionId) -> bool {
        self.shared.subscriptions.remove(id)
    }

    pub fn webhook_subscriptions(&self) -> Vec<WebhookSubscription> {
        self.shared.subscriptions.list()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────────

    pub fn statistics(&self) -> BusStatistics {
        let shared = &self.shared;
        let uptime_secs = shared
            .lifecycle
            .lock()
            .as_ref()
            .map_or(0, |l| l.started_at.elapsed().as_secs());
        let cutoff = Utc::now() - chrono::Duration::minutes(PERFORMANCE_WINDOW_MINUTES);

        BusStatistics {
            counters: shared.counters.snapshot(),
            running: self.is_running(),
            worker_count: shared.config.worker_count,
            uptime_secs,
            queue_size: shared.queue.len(),
            max_queue_size: shared.queue.capacity(),
            queue_high_water_mark: shared.queue.high_water_mark(),
            dead_letter_size: shared.history.dead_letters.len(),
            processing_count: shared.in_flight.len(),
            pending_retries: shared.pending_retries.load(Ordering::SeqCst),
            history_size: shared.history.events.len(),
            failed_events_size: shared.history.failed.len(),
            replay_buffer_size: shared.history.replay.len(),
            webhook_outbox_size: shared.subscriptions.outbox_len(),
            buffer_capacities: shared.config.buffers.clone(),
            handlers_by_event_type: shared.registry.counts_by_event_type(),
            performance_samples_5m: shared
                .history
                .performance
                .count_where(|s| s.recorded_at >= cutoff),
            aggregated: shared.aggregates.get(),
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let counters = self.shared.counters.snapshot();
        HealthReport::evaluate(
            counters.events_published,
            counters.events_failed,
            self.shared.queue.len(),
            self.shared.queue.capacity(),
        )
        .with_running(self.is_running())
    }

    /// Newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<EventSummary> {
        self.shared.history.events.recent(limit)
    }

    /// Newest first.
    pub fn failed_events(&self, limit: usize) -> Vec<FailedEvent> {
        self.shared.history.failed.recent(limit)
    }

    /// Newest first.
    pub fn dead_letters(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.shared.history.dead_letters.recent(limit)
    }

    pub fn processing_events(&self) -> Vec<ProcessingEntry> {
        self.shared.in_flight.snapshot()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replay / dead letters
    // ─────────────────────────────────────────────────────────────────────────

    /// Republish buffered events whose timestamp lies in `[from, to]`
    /// (`to` defaults to now), optionally restricted to `event_types`.
    ///
    /// Returns how many copies were admitted.
    pub fn replay(
        &self,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
        event_types: Option<&[EventType]>,
    ) -> usize {
        let to = to.unwrap_or_else(Utc::now);
        let candidates: Vec<Event> = self
            .shared
            .history
            .replay
            .snapshot()
            .into_iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .filter(|e| event_types.is_none_or(|types| types.contains(&e.event_type)))
            .collect();

        let replayed = candidates
            .iter()
            .filter(|original| self.publish(original.replay_copy()))
            .count();

        info!(
            from = %from,
            to = %to,
            candidates = candidates.len(),
            replayed,
            "events replayed"
        );
        replayed
    }

    /// Move a dead-lettered event back into the queue with a fresh retry budget.
    pub fn requeue_dead_letter(&self, event_id: EventId) -> bool {
        let dead_letters = &self.shared.history.dead_letters;
        let Some(entry) = dead_letters.take_first(|e| e.event.id == event_id) else {
            return false;
        };

        let mut event = entry.event.clone();
        event.reset_for_requeue();
        match self.try_publish(event) {
            Ok(_) => {
                info!(event_id = %event_id, "dead-lettered event requeued");
                true
            }
            Err(err) => {
                warn!(event_id = %event_id, error = %err, "dead-letter requeue failed");
                dead_letters.push(entry);
                false
            }
        }
    }

    /// Drop every dead-lettered event, returning how many were removed.
    pub fn purge_dead_letters(&self) -> usize {
        let purged = self.shared.history.dead_letters.clear();
        info!(purged, "dead-letter buffer purged");
        purged
    }
}

fn aggregate(
    registry: &HandlerRegistry,
    subscriptions: &SubscriptionRegistry,
    history: &History,
) -> AggregatedStats {
    let samples =
        history.samples_since(Utc::now() - chrono::Duration::minutes(PERFORMANCE_WINDOW_MINUTES));
    let avg_processing_time_ms = if samples.is_empty() {
        0.0
    } else {
        samples.iter().map(|s| s.duration_ms as f64).sum::<f64>() / samples.len() as f64
    };

    AggregatedStats {
        handlers_registered: registry.len(),
        handlers_active: registry.active_count(),
        subscriptions_active: subscriptions.active_count(),
        avg_processing_time_ms,
        events_per_minute: samples.len() as f64 / PERFORMANCE_WINDOW_MINUTES as f64,
        last_aggregated_at: Some(Utc::now()),
    }
}

/// Run `tick` every `period` until `token` is cancelled.
///
/// Each tick runs on its own task so a panic is logged and the loop carries on.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    token: CancellationToken,
    period: Duration,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = tokio::spawn(tick()).await {
                        error!(task = name, error = %err, "periodic bus task panicked");
                    }
                }
            }
        }
        debug!(task = name, "periodic bus task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let bus = EventBus::new(BusConfig::default().with_worker_count(1));

        assert!(!bus.stop().await);
        assert!(bus.start().await);
        assert!(!bus.start().await);
        assert!(bus.is_running());
        assert!(bus.stop().await);
        assert!(!bus.stop().await);
        assert!(!bus.is_running());
    }

    #[tokio::test]
    async fn publishing_to_a_stopped_bus_is_rejected_and_recorded() {
        let bus = EventBus::default();
        let event = Event::new(EventType::OrderCreated, "sales");

        assert_eq!(bus.try_publish(event), Err(PublishError::NotRunning));

        let failed = bus.failed_events(10);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, FailureReason::BusNotRunning);
        assert_eq!(bus.statistics().counters.events_rejected, 1);
    }

    #[tokio::test]
    async fn startup_event_is_published() {
        let bus = EventBus::new(BusConfig::default().with_worker_count(1));
        bus.start().await;

        let recent = bus.recent_events(10);
        assert!(recent.iter().any(|e| e.event_type == EventType::SystemStartup));
        bus.stop().await;
    }

    #[test]
    fn subscribe_works_without_a_running_bus() {
        let bus = EventBus::default();
        let id = bus.subscribe(HandlerRegistration::new(
            [EventType::UserCreated],
            crate::handler::HandlerAction::blocking(|_| Ok(())),
        ));
        assert!(bus.handler_info(id).is_some());
        assert!(bus.unsubscribe(id));
        assert!(bus.handler_info(id).is_none());
    }
}
