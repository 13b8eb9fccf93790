//! Event handlers: the capability consumers register with the bus.
//!
//! A handler is either *async* (runs on its own tokio task) or *sync*
//! (runs on the blocking pool so it cannot stall a dispatcher worker). Both
//! are invoked under the handler's timeout, and a failure in one handler never
//! affects other handlers or other events.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use erpbus_core::HandlerId;

use crate::event::{Event, EventPriority, EventType};

/// Priority given to handlers registered without one. Lower runs first.
pub const DEFAULT_HANDLER_PRIORITY: i32 = 100;

/// Reserved filter keys matched against event attributes instead of `data`.
pub const FILTER_TENANT_ID: &str = "tenant_id";
pub const FILTER_ORGANIZATION_ID: &str = "organization_id";
pub const FILTER_USER_ID: &str = "user_id";
pub const FILTER_PRIORITY: &str = "priority";

/// Async event handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Blocking handler body.
pub type SyncHandlerFn = dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync;

/// How a handler is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    Async,
    Sync,
}

/// The callable part of a handler.
#[derive(Clone)]
pub enum HandlerAction {
    Async(Arc<dyn EventHandler>),
    Sync(Arc<SyncHandlerFn>),
}

impl HandlerAction {
    pub fn handler<H>(handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        Self::Async(Arc::new(handler))
    }

    /// Wrap an async closure. The closure receives an owned copy of the event.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::Async(Arc::new(FnHandler(f)))
    }

    /// Wrap a blocking closure; it runs on the blocking thread pool.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn kind(&self) -> DispatchKind {
        match self {
            HandlerAction::Async(_) => DispatchKind::Async,
            HandlerAction::Sync(_) => DispatchKind::Sync,
        }
    }
}

impl core::fmt::Debug for HandlerAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "HandlerAction::{:?}", self.kind())
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Key → value predicates an event must satisfy for a handler to run.
///
/// `tenant_id`, `organization_id` and `user_id` (camelCase accepted too)
/// compare against the event's scoping ids; `priority` accepts one name or a list of names; every other
/// key is compared for equality with `event.data[key]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerFilters(BTreeMap<String, Value>);

impl HandlerFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.0.iter().all(|(key, expected)| match key.as_str() {
            FILTER_TENANT_ID | "tenantId" => {
                id_matches(event.tenant_id.map(|id| id.to_string()), expected)
            }
            FILTER_ORGANIZATION_ID | "organizationId" => {
                id_matches(event.organization_id.map(|id| id.to_string()), expected)
            }
            FILTER_USER_ID | "userId" => {
                id_matches(event.user_id.map(|id| id.to_string()), expected)
            }
            FILTER_PRIORITY => priority_matches(event.priority, expected),
            other => event.data.get(other) == Some(expected),
        })
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for HandlerFilters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

fn id_matches(actual: Option<String>, expected: &Value) -> bool {
    match (actual, expected) {
        (Some(actual), Value::String(expected)) => actual.eq_ignore_ascii_case(expected),
        (None, Value::Null) => true,
        _ => false,
    }
}

fn priority_matches(actual: EventPriority, expected: &Value) -> bool {
    let named = |v: &Value| v.as_str().is_some_and(|s| s.eq_ignore_ascii_case(actual.as_str()));
    match expected {
        Value::Array(options) => options.iter().any(named),
        single => named(single),
    }
}

/// What a consumer passes to `subscribe`.
#[derive(Debug, Clone)]
pub struct HandlerRegistration {
    pub event_types: BTreeSet<EventType>,
    pub action: HandlerAction,
    pub name: Option<String>,
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub filters: HandlerFilters,
    pub enabled: bool,
}

impl HandlerRegistration {
    pub fn new(event_types: impl IntoIterator<Item = EventType>, action: HandlerAction) -> Self {
        Self {
            event_types: event_types.into_iter().collect(),
            action,
            name: None,
            priority: DEFAULT_HANDLER_PRIORITY,
            timeout: None,
            filters: HandlerFilters::default(),
            enabled: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_filters(mut self, filters: HandlerFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters = self.filters.with(key, value);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Mutable execution counters of a registered handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerMetrics {
    /// Executions started, including ones still running.
    pub execution_count: u64,
    /// Executions finished; the sample count behind the mean.
    pub completed_count: u64,
    pub error_count: u64,
    /// Running mean over completed executions.
    pub avg_execution_time_ms: f64,
    pub last_executed_at: Option<DateTime<Utc>>,
}

/// A handler owned by the registry.
#[derive(Debug)]
pub struct RegisteredHandler {
    pub id: HandlerId,
    pub name: String,
    pub event_types: BTreeSet<EventType>,
    pub action: HandlerAction,
    pub priority: i32,
    pub timeout: Duration,
    pub filters: HandlerFilters,
    pub created_at: DateTime<Utc>,
    enabled: AtomicBool,
    metrics: Mutex<HandlerMetrics>,
}

impl RegisteredHandler {
    pub(crate) fn from_registration(registration: HandlerRegistration, default_timeout: Duration) -> Self {
        let id = HandlerId::new();
        Self {
            name: registration
                .name
                .unwrap_or_else(|| format!("handler-{id}")),
            id,
            event_types: registration.event_types,
            action: registration.action,
            priority: registration.priority,
            timeout: registration.timeout.unwrap_or(default_timeout),
            filters: registration.filters,
            created_at: Utc::now(),
            enabled: AtomicBool::new(registration.enabled),
            metrics: Mutex::new(HandlerMetrics::default()),
        }
    }

    pub fn dispatch_kind(&self) -> DispatchKind {
        self.action.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Enabled, subscribed to the event's type, and every filter satisfied.
    pub fn matches(&self, event: &Event) -> bool {
        self.is_enabled()
            && self.event_types.contains(&event.event_type)
            && self.filters.matches(event)
    }

    pub fn metrics(&self) -> HandlerMetrics {
        self.metrics.lock().clone()
    }

    pub(crate) fn begin_execution(&self) {
        let mut m = self.metrics.lock();
        m.execution_count += 1;
        m.last_executed_at = Some(Utc::now());
    }

    pub(crate) fn finish_execution(&self, elapsed_ms: f64, failed: bool) {
        let mut m = self.metrics.lock();
        if failed {
            m.error_count += 1;
        }
        m.completed_count += 1;
        let n = m.completed_count as f64;
        m.avg_execution_time_ms = (m.avg_execution_time_ms * (n - 1.0) + elapsed_ms) / n;
    }

    pub fn info(&self) -> HandlerInfo {
        HandlerInfo {
            id: self.id,
            name: self.name.clone(),
            event_types: self.event_types.iter().cloned().collect(),
            dispatch_kind: self.dispatch_kind(),
            priority: self.priority,
            timeout_seconds: self.timeout.as_secs_f64(),
            filters: self.filters.clone(),
            enabled: self.is_enabled(),
            created_at: self.created_at,
            metrics: self.metrics(),
        }
    }
}

/// Serializable view of a registered handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerInfo {
    pub id: HandlerId,
    pub name: String,
    pub event_types: Vec<EventType>,
    pub dispatch_kind: DispatchKind,
    pub priority: i32,
    pub timeout_seconds: f64,
    pub filters: HandlerFilters,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub metrics: HandlerMetrics,
}
