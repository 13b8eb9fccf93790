//! Bounded in-memory history: published summaries, rejected/failed events,
//! performance samples, the replay buffer, and the dead-letter buffer.
//!
//! Nothing here is durable. Every buffer drops its oldest entry once full.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use erpbus_core::{CorrelationId, EventId, TenantId};

use crate::config::BufferSizes;
use crate::event::{Event, EventPriority, EventType};
use crate::ring::RingBuffer;

/// Lightweight record of an admitted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: EventId,
    pub event_type: EventType,
    pub source: String,
    pub priority: EventPriority,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    pub tenant_id: Option<TenantId>,
    pub published_at: DateTime<Utc>,
}

impl From<&Event> for EventSummary {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type.clone(),
            source: event.source.clone(),
            priority: event.priority,
            timestamp: event.timestamp,
            correlation_id: event.correlation_id,
            tenant_id: event.tenant_id,
            published_at: Utc::now(),
        }
    }
}

/// Why an event ended up in the failed-events buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    BusNotRunning,
    ValidationFailed,
    QueueOverflow,
    /// Pushed out of a full queue by a more urgent event.
    EvictedForPriority,
    /// Handlers kept failing and dead-lettering is disabled.
    RetriesExhausted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::BusNotRunning => "bus_not_running",
            FailureReason::ValidationFailed => "validation_failed",
            FailureReason::QueueOverflow => "queue_overflow",
            FailureReason::EvictedForPriority => "evicted_for_priority",
            FailureReason::RetriesExhausted => "retries_exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub event: Event,
    pub reason: FailureReason,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl FailedEvent {
    pub fn new(event: Event, reason: FailureReason, error: Option<String>) -> Self {
        Self {
            event,
            reason,
            error,
            recorded_at: Utc::now(),
        }
    }
}

/// Timing of one processing attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub event_id: EventId,
    pub event_type: EventType,
    pub duration_ms: u64,
    pub success: bool,
    pub handlers_invoked: usize,
    pub recorded_at: DateTime<Utc>,
}

/// Entry in the dead-letter buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event: Event,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(event: Event, reason: String) -> Self {
        Self {
            event,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

#[derive(Debug)]
pub struct History {
    pub events: RingBuffer<EventSummary>,
    pub failed: RingBuffer<FailedEvent>,
    pub performance: RingBuffer<PerformanceSample>,
    /// Every offered event, admitted or not.
    pub replay: RingBuffer<Event>,
    pub dead_letters: RingBuffer<DeadLetterEntry>,
}

impl History {
    pub fn new(sizes: &BufferSizes) -> Self {
        Self {
            events: RingBuffer::new(sizes.history),
            failed: RingBuffer::new(sizes.failed),
            performance: RingBuffer::new(sizes.performance),
            replay: RingBuffer::new(sizes.replay),
            dead_letters: RingBuffer::new(sizes.dead_letter),
        }
    }

    pub fn record_failure(&self, event: Event, reason: FailureReason, error: Option<String>) {
        self.failed.push(FailedEvent::new(event, reason, error));
    }

    pub fn samples_since(&self, cutoff: DateTime<Utc>) -> Vec<PerformanceSample> {
        self.performance
            .snapshot()
            .into_iter()
            .filter(|s| s.recorded_at >= cutoff)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reasons_serialize_to_snake_case() {
        let json = serde_json::to_value(FailureReason::QueueOverflow).unwrap();
        assert_eq!(json, serde_json::json!("queue_overflow"));
        assert_eq!(FailureReason::QueueOverflow.as_str(), "queue_overflow");
    }

    #[test]
    fn samples_since_filters_by_recording_time() {
        let history = History::new(&BufferSizes::default());
        let old = PerformanceSample {
            event_id: EventId::new(),
            event_type: EventType::OrderCreated,
            duration_ms: 3,
            success: true,
            handlers_invoked: 1,
            recorded_at: Utc::now() - chrono::Duration::minutes(10),
        };
        let fresh = PerformanceSample {
            recorded_at: Utc::now(),
            ..old.clone()
        };
        history.performance.push(old);
        history.performance.push(fresh.clone());

        let recent = history.samples_since(Utc::now() - chrono::Duration::minutes(5));
        assert_eq!(recent, vec![fresh]);
    }
}
