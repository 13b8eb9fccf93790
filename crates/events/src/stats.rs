//! Bus counters, statistics snapshot, and health evaluation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::BufferSizes;

/// Monotonic bus counters.
#[derive(Debug, Default)]
pub struct Counters {
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// One failed processing attempt.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            events_published: self.published.load(Ordering::Relaxed),
            events_processed: self.processed.load(Ordering::Relaxed),
            events_failed: self.failed.load(Ordering::Relaxed),
            events_retried: self.retried.load(Ordering::Relaxed),
            events_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            events_rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub events_published: u64,
    pub events_processed: u64,
    pub events_failed: u64,
    pub events_retried: u64,
    pub events_dead_lettered: u64,
    pub events_rejected: u64,
}

/// Values recomputed by the stats aggregation task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedStats {
    pub handlers_registered: usize,
    pub handlers_active: usize,
    pub subscriptions_active: usize,
    /// Mean over the performance samples of the last five minutes.
    pub avg_processing_time_ms: f64,
    pub events_per_minute: f64,
    pub last_aggregated_at: Option<DateTime<Utc>>,
}

/// Holder for the latest [`AggregatedStats`].
#[derive(Debug, Default)]
pub(crate) struct Aggregates(Mutex<AggregatedStats>);

impl Aggregates {
    pub(crate) fn get(&self) -> AggregatedStats {
        self.0.lock().clone()
    }

    pub(crate) fn set(&self, stats: AggregatedStats) {
        *self.0.lock() = stats;
    }
}

/// Point-in-time view of the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusStatistics {
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    pub running: bool,
    pub worker_count: usize,
    pub uptime_secs: u64,
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub queue_high_water_mark: usize,
    pub dead_letter_size: usize,
    pub processing_count: usize,
    pub pending_retries: usize,
    pub history_size: usize,
    pub failed_events_size: usize,
    pub replay_buffer_size: usize,
    pub webhook_outbox_size: usize,
    pub buffer_capacities: BufferSizes,
    pub handlers_by_event_type: BTreeMap<String, usize>,
    /// Performance samples recorded in the last five minutes.
    pub performance_samples_5m: usize,
    pub aggregated: AggregatedStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }
}

pub const CRITICAL_ERROR_RATE: f64 = 0.10;
pub const DEGRADED_ERROR_RATE: f64 = 0.05;
pub const DEGRADED_QUEUE_UTILIZATION: f64 = 0.8;
pub const WARNING_QUEUE_UTILIZATION: f64 = 0.6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub running: bool,
    pub queue_utilization: f64,
    pub error_rate: f64,
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub events_published: u64,
    pub events_failed: u64,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Classify the bus from its counters and queue depth.
    ///
    /// `error_rate = failed / max(published, 1)`, `utilization = depth / capacity`.
    pub fn evaluate(published: u64, failed: u64, queue_size: usize, max_queue_size: usize) -> Self {
        let error_rate = failed as f64 / published.max(1) as f64;
        let queue_utilization = queue_size as f64 / max_queue_size.max(1) as f64;

        let status = if error_rate > CRITICAL_ERROR_RATE {
            HealthStatus::Critical
        } else if error_rate > DEGRADED_ERROR_RATE || queue_utilization > DEGRADED_QUEUE_UTILIZATION {
            HealthStatus::Degraded
        } else if queue_utilization > WARNING_QUEUE_UTILIZATION {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            running: false,
            queue_utilization,
            error_rate,
            queue_size,
            max_queue_size,
            events_published: published,
            events_failed: failed,
            checked_at: Utc::now(),
        }
    }

    pub fn with_running(mut self, running: bool) -> Self {
        self.running = running;
        self
    }
}
