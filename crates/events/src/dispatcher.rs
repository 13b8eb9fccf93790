//! Dispatcher worker pool and per-event handler execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use erpbus_core::{EventId, HandlerId};

use crate::error::HandlerFailure;
use crate::event::{Event, EventPriority, EventType, duration_ms};
use crate::handler::{HandlerAction, RegisteredHandler};
use crate::history::{DeadLetterEntry, FailureReason, History, PerformanceSample};
use crate::queue::AdmissionQueue;
use crate::registry::HandlerRegistry;
use crate::retry::RetryScheduler;
use crate::stats::Counters;

/// An event currently held by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingEntry {
    pub event_id: EventId,
    pub event_type: EventType,
    pub source: String,
    pub priority: EventPriority,
    pub retry_count: u32,
    pub worker: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct InFlight(Mutex<HashMap<EventId, ProcessingEntry>>);

impl InFlight {
    fn insert(&self, worker: usize, event: &Event) {
        self.0.lock().insert(
            event.id,
            ProcessingEntry {
                event_id: event.id,
                event_type: event.event_type.clone(),
                source: event.source.clone(),
                priority: event.priority,
                retry_count: event.retry_count,
                worker,
                started_at: Utc::now(),
            },
        );
    }

    fn remove(&self, id: EventId) {
        self.0.lock().remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Oldest first.
    pub(crate) fn snapshot(&self) -> Vec<ProcessingEntry> {
        let mut entries: Vec<ProcessingEntry> = self.0.lock().values().cloned().collect();
        entries.sort_by_key(|e| e.started_at);
        entries
    }
}

/// One handler's failed contribution to an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerError {
    pub handler_id: HandlerId,
    pub handler_name: String,
    pub failure: HandlerFailure,
}

/// Result of running every matching handler for one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub handlers_invoked: usize,
    pub failures: Vec<HandlerError>,
}

impl ExecutionReport {
    /// True when no matching handler failed (vacuously true with no handlers).
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.handler_name, f.failure))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Run the matching handlers for `event` one after another, in priority order.
///
/// A failing handler is counted and skipped; the remaining handlers still run.
pub async fn execute(registry: &HandlerRegistry, event: &Event) -> ExecutionReport {
    let mut report = ExecutionReport::default();

    for handler in registry.matching(event) {
        report.handlers_invoked += 1;
        handler.begin_execution();

        let started = Instant::now();
        let outcome = invoke(&handler, event).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        handler.finish_execution(elapsed_ms, outcome.is_err());

        if let Err(failure) = outcome {
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                handler = %handler.name,
                error = %failure,
                "event handler failed"
            );
            report.failures.push(HandlerError {
                handler_id: handler.id,
                handler_name: handler.name.clone(),
                failure,
            });
        }
    }

    report
}

async fn invoke(handler: &RegisteredHandler, event: &Event) -> Result<(), HandlerFailure> {
    let owned = event.clone();

    match &handler.action {
        HandlerAction::Async(action) => {
            let action = action.clone();
            let mut task = tokio::spawn(async move { action.handle(&owned).await });
            match tokio::time::timeout(handler.timeout, &mut task).await {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    task.abort();
                    Err(HandlerFailure::TimedOut(handler.timeout))
                }
            }
        }
        HandlerAction::Sync(action) => {
            let action = action.clone();
            let task = tokio::task::spawn_blocking(move || action(&owned));
            // A blocking thread cannot be interrupted; on timeout its result is discarded.
            match tokio::time::timeout(handler.timeout, task).await {
                Ok(joined) => flatten(joined),
                Err(_) => Err(HandlerFailure::TimedOut(handler.timeout)),
            }
        }
    }
}

fn flatten(joined: Result<anyhow::Result<()>, JoinError>) -> Result<(), HandlerFailure> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(HandlerFailure::Error(format!("{err:#}"))),
        Err(err) => Err(HandlerFailure::Panicked(panic_message(err))),
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "handler task cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Shared state the workers operate on.
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    pub(crate) queue: Arc<AdmissionQueue>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) history: Arc<History>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) in_flight: Arc<InFlight>,
    pub(crate) retries: RetryScheduler,
    pub(crate) enable_dead_letter: bool,
    pub(crate) poll_interval: Duration,
}

impl Dispatcher {
    pub(crate) fn spawn_workers(&self, count: usize, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| tokio::spawn(self.clone().run_worker(worker, token.clone())))
            .collect()
    }

    async fn run_worker(self, worker: usize, token: CancellationToken) {
        debug!(worker, "dispatcher worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = self.queue.dequeue(self.poll_interval) => next,
            };

            // Processing is not raced against the token: an in-flight event
            // always completes and has its outcome recorded.
            if let Some(event) = next {
                self.process(worker, event).await;
            }
        }

        debug!(worker, "dispatcher worker stopped");
    }

    pub(crate) async fn process(&self, worker: usize, mut event: Event) {
        event.mark_processing();
        self.in_flight.insert(worker, &event);

        let started = Instant::now();
        let report = execute(&self.registry, &event).await;
        let elapsed = started.elapsed();
        let success = report.is_success();

        if success {
            event.mark_processed(elapsed);
        } else {
            event.mark_failed(elapsed);
        }

        self.history.performance.push(PerformanceSample {
            event_id: event.id,
            event_type: event.event_type.clone(),
            duration_ms: duration_ms(elapsed),
            success,
            handlers_invoked: report.handlers_invoked,
            recorded_at: Utc::now(),
        });
        self.in_flight.remove(event.id);

        if success {
            self.counters.record_processed();
            debug!(
                worker,
                event_id = %event.id,
                event_type = %event.event_type,
                handlers = report.handlers_invoked,
                elapsed_ms = duration_ms(elapsed),
                "event processed"
            );
            return;
        }

        self.counters.record_failed();
        let error = report.summary();

        if event.can_retry() {
            event.mark_retry();
            self.counters.record_retried();
            warn!(
                worker,
                event_id = %event.id,
                retry_count = event.retry_count,
                max_retries = event.max_retries,
                error = %error,
                "event processing failed; will retry"
            );
            self.retries.schedule(event);
        } else if self.enable_dead_letter {
            event.mark_dead_letter();
            self.counters.record_dead_lettered();
            error!(
                worker,
                event_id = %event.id,
                event_type = %event.event_type,
                retry_count = event.retry_count,
                error = %error,
                "event dead-lettered"
            );
            self.history.dead_letters.push(DeadLetterEntry::new(event, error));
        } else {
            error!(
                worker,
                event_id = %event.id,
                event_type = %event.event_type,
                error = %error,
                "event retries exhausted"
            );
            self.history
                .record_failure(event, FailureReason::RetriesExhausted, Some(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new(Duration::from_secs(5))
    }

    fn event() -> Event {
        Event::new(EventType::OrderCreated, "sales")
    }

    #[tokio::test]
    async fn no_matching_handlers_is_a_success() {
        let report = execute(&registry(), &event()).await;
        assert!(report.is_success());
        assert_eq!(report.handlers_invoked, 0);
    }

    #[tokio::test]
    async fn handlers_run_in_priority_order() {
        let registry = registry();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("late", 20), ("early", 1), ("middle", 10)] {
            let order = order.clone();
            registry.register(
                HandlerRegistration::new(
                    [EventType::OrderCreated],
                    HandlerAction::from_fn(move |_| {
                        let order = order.clone();
                        async move {
                            order.lock().push(name);
                            Ok(())
                        }
                    }),
                )
                .with_priority(priority),
            );
        }

        let report = execute(&registry, &event()).await;
        assert!(report.is_success());
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn failures_are_isolated_per_handler() {
        let registry = registry();
        let ran = Arc::new(AtomicUsize::new(0));

        registry.register(
            HandlerRegistration::new(
                [EventType::OrderCreated],
                HandlerAction::from_fn(|_| async { Err::<(), _>(anyhow::anyhow!("ledger unavailable")) }),
            )
            .with_name("erroring")
            .with_priority(1),
        );
        registry.register(
            HandlerRegistration::new(
                [EventType::OrderCreated],
                HandlerAction::blocking(|_| panic!("boom")),
            )
            .with_name("panicking")
            .with_priority(2),
        );
        registry.register(
            HandlerRegistration::new(
                [EventType::OrderCreated],
                HandlerAction::from_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }),
            )
            .with_name("slow")
            .with_priority(3)
            .with_timeout(Duration::from_millis(20)),
        );
        {
            let ran = ran.clone();
            registry.register(
                HandlerRegistration::new(
                    [EventType::OrderCreated],
                    HandlerAction::blocking(move |_| {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
                .with_name("healthy")
                .with_priority(4),
            );
        }

        let report = execute(&registry, &event()).await;

        assert_eq!(report.handlers_invoked, 4);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let failures: Vec<_> = report
            .failures
            .iter()
            .map(|f| (f.handler_name.as_str(), &f.failure))
            .collect();
        assert_eq!(failures.len(), 3);
        assert!(matches!(failures[0], ("erroring", HandlerFailure::Error(msg)) if msg.contains("ledger")));
        assert!(matches!(failures[1], ("panicking", HandlerFailure::Panicked(msg)) if msg == "boom"));
        assert!(matches!(failures[2], ("slow", HandlerFailure::TimedOut(_))));
    }

    #[tokio::test]
    async fn blocking_handler_past_its_timeout_fails_and_the_next_still_runs() {
        let registry = registry();
        let ran = Arc::new(AtomicUsize::new(0));

        registry.register(
            HandlerRegistration::new(
                [EventType::OrderCreated],
                HandlerAction::blocking(|_| {
                    std::thread::sleep(Duration::from_millis(200));
                    Ok(())
                }),
            )
            .with_name("slow-export")
            .with_priority(1)
            .with_timeout(Duration::from_millis(20)),
        );
        {
            let ran = ran.clone();
            registry.register(
                HandlerRegistration::new(
                    [EventType::OrderCreated],
                    HandlerAction::blocking(move |_| {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
                .with_name("after")
                .with_priority(2),
            );
        }

        let started = Instant::now();
        let report = execute(&registry, &event()).await;

        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(report.handlers_invoked, 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].handler_name, "slow-export");
        assert_eq!(
            report.failures[0].failure,
            HandlerFailure::TimedOut(Duration::from_millis(20))
        );
    }

    #[tokio::test]
    async fn handler_metrics_are_updated() {
        let registry = registry();
        let handler = registry.register(HandlerRegistration::new(
            [EventType::OrderCreated],
            HandlerAction::from_fn(|_| async { Err::<(), _>(anyhow::anyhow!("nope")) }),
        ));

        execute(&registry, &event()).await;
        execute(&registry, &event()).await;

        let metrics = handler.metrics();
        assert_eq!(metrics.execution_count, 2);
        assert_eq!(metrics.error_count, 2);
        assert!(metrics.last_executed_at.is_some());
    }
}
