//! `erpbus-events` — in-process event bus with asynchronous dispatch.
//!
//! Producers publish [`Event`]s into a bounded admission queue; a pool of
//! tokio workers dispatches each event to the matching handlers in priority
//! order, retrying failures with backoff and dead-lettering events whose
//! retries are exhausted.

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handler;
pub mod history;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod ring;
pub mod stats;
pub mod subscription;

pub use bus::EventBus;
pub use config::{BufferSizes, BusConfig};
pub use dispatcher::{ExecutionReport, HandlerError, ProcessingEntry};
pub use error::{ConfigError, HandlerFailure, PublishError};
pub use event::{Event, EventPriority, EventStatus, EventType};
pub use handler::{
    DispatchKind, EventHandler, HandlerAction, HandlerFilters, HandlerInfo, HandlerMetrics,
    HandlerRegistration,
};
pub use history::{DeadLetterEntry, EventSummary, FailedEvent, FailureReason, PerformanceSample};
pub use policy::{DeadLetterPolicy, NoopWebhookDelivery, RetainDeadLetters, WebhookDeliveryPolicy};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use stats::{AggregatedStats, BusStatistics, CounterSnapshot, HealthReport, HealthStatus};
pub use subscription::{DeliveryOutcome, HttpMethod, WebhookBatch, WebhookSubscription};

pub use erpbus_core::{
    CorrelationId, EventId, HandlerId, OrganizationId, SubscriptionId, TenantId, UserId,
};
