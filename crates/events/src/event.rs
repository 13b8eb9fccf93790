//! The event record and its closed vocabularies (type, priority, status).

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use erpbus_core::{
    CorrelationId, DomainError, DomainResult, EventId, OrganizationId, TenantId, UserId,
};

/// Default number of retries an event gets before it is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Metadata key stamped on replayed copies, pointing at the original event id.
pub const REPLAYED_FROM_KEY: &str = "replayed_from";

/// Catalog of event kinds known to the ERP, plus a `Custom` escape hatch.
///
/// Serialized as the dotted name (e.g. `"user.created"`); unknown names
/// deserialize into `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventType {
    UserCreated,
    UserUpdated,
    UserDeleted,
    UserLogin,
    UserLogout,
    OrganizationCreated,
    OrganizationUpdated,
    InventoryAdjusted,
    OrderCreated,
    OrderUpdated,
    InvoiceIssued,
    PaymentReceived,
    DataImported,
    DataExported,
    ReportGenerated,
    SystemStartup,
    SystemShutdown,
    SystemError,
    SystemMaintenance,
    AuditLog,
    SecurityAlert,
    SecurityLoginFailed,
    Custom(String),
}

impl EventType {
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventType::UserCreated => "user.created",
            EventType::UserUpdated => "user.updated",
            EventType::UserDeleted => "user.deleted",
            EventType::UserLogin => "user.login",
            EventType::UserLogout => "user.logout",
            EventType::OrganizationCreated => "organization.created",
            EventType::OrganizationUpdated => "organization.updated",
            EventType::InventoryAdjusted => "inventory.adjusted",
            EventType::OrderCreated => "order.created",
            EventType::OrderUpdated => "order.updated",
            EventType::InvoiceIssued => "invoice.issued",
            EventType::PaymentReceived => "payment.received",
            EventType::DataImported => "data.imported",
            EventType::DataExported => "data.exported",
            EventType::ReportGenerated => "report.generated",
            EventType::SystemStartup => "system.startup",
            EventType::SystemShutdown => "system.shutdown",
            EventType::SystemError => "system.error",
            EventType::SystemMaintenance => "system.maintenance",
            EventType::AuditLog => "audit.log",
            EventType::SecurityAlert => "security.alert",
            EventType::SecurityLoginFailed => "security.login_failed",
            EventType::Custom(name) => name,
        }
    }

    /// A custom type with a blank name counts as "no type at all".
    pub fn is_blank(&self) -> bool {
        matches!(self, EventType::Custom(name) if name.trim().is_empty())
    }

    const KNOWN: [EventType; 22] = [
        EventType::UserCreated,
        EventType::UserUpdated,
        EventType::UserDeleted,
        EventType::UserLogin,
        EventType::UserLogout,
        EventType::OrganizationCreated,
        EventType::OrganizationUpdated,
        EventType::InventoryAdjusted,
        EventType::OrderCreated,
        EventType::OrderUpdated,
        EventType::InvoiceIssued,
        EventType::PaymentReceived,
        EventType::DataImported,
        EventType::DataExported,
        EventType::ReportGenerated,
        EventType::SystemStartup,
        EventType::SystemShutdown,
        EventType::SystemError,
        EventType::SystemMaintenance,
        EventType::AuditLog,
        EventType::SecurityAlert,
        EventType::SecurityLoginFailed,
    ];
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self::KNOWN
            .iter()
            .find(|known| known.as_str() == value)
            .cloned()
            .unwrap_or(EventType::Custom(value))
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Custom(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// Event priority. Ordered: `Low < Normal < High < Critical < Emergency`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
    Emergency,
}

impl EventPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Low => "low",
            EventPriority::Normal => "normal",
            EventPriority::High => "high",
            EventPriority::Critical => "critical",
            EventPriority::Emergency => "emergency",
        }
    }

    /// Urgent events may force their way into a full queue.
    pub fn is_urgent(&self) -> bool {
        matches!(self, EventPriority::Critical | EventPriority::Emergency)
    }
}

impl FromStr for EventPriority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(EventPriority::Low),
            "normal" => Ok(EventPriority::Normal),
            "high" => Ok(EventPriority::High),
            "critical" => Ok(EventPriority::Critical),
            "emergency" => Ok(EventPriority::Emergency),
            other => Err(DomainError::unknown("priority", other)),
        }
    }
}

impl core::fmt::Display for EventPriority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state of an event.
///
/// `Pending → Processing → {Processed | Failed}`, then `Failed → Retry → Pending`
/// while retries remain, or `Failed → DeadLetter` once they are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Pending,
    Processing,
    Processed,
    Failed,
    Retry,
    DeadLetter,
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Processed | EventStatus::DeadLetter)
    }
}

/// One occurrence published to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub correlation_id: CorrelationId,
    pub event_type: EventType,
    /// Free-text name of the producer.
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Bookkeeping (replay provenance, request ids, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub priority: EventPriority,
    #[serde(default)]
    pub status: EventStatus,
    /// Back-reference only; the parent is not owned.
    pub parent_event_id: Option<EventId>,
    pub tenant_id: Option<TenantId>,
    pub user_id: Option<UserId>,
    pub organization_id: Option<OrganizationId>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub processing_time_ms: Option<u64>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Event {
    /// Create a pending event. The correlation id defaults to the event's own id.
    pub fn new(event_type: impl Into<EventType>, source: impl Into<String>) -> Self {
        let id = EventId::new();
        Self {
            id,
            correlation_id: id.into(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            data: Map::new(),
            metadata: Map::new(),
            priority: EventPriority::Normal,
            status: EventStatus::Pending,
            parent_event_id: None,
            tenant_id: None,
            user_id: None,
            organization_id: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            processing_time_ms: None,
        }
    }

    /// Set the payload. Objects are used as-is; any other value lands under `"value"`.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = into_map(data);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_organization(mut self, organization_id: OrganizationId) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_parent(mut self, parent_event_id: EventId) -> Self {
        self.parent_event_id = Some(parent_event_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the occurrence time (imports, tests, replays of old data).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check the fields required for admission: id, type, source.
    ///
    /// The timestamp is always present by construction.
    pub fn validate(&self) -> DomainResult<()> {
        if self.id.is_nil() {
            return Err(DomainError::validation("event id is missing"));
        }
        if self.event_type.is_blank() {
            return Err(DomainError::validation("event type is missing"));
        }
        if self.source.trim().is_empty() {
            return Err(DomainError::validation("event source is missing"));
        }
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn mark_processing(&mut self) {
        self.status = EventStatus::Processing;
    }

    pub fn mark_processed(&mut self, elapsed: Duration) {
        self.status = EventStatus::Processed;
        self.processing_time_ms = Some(duration_ms(elapsed));
    }

    pub fn mark_failed(&mut self, elapsed: Duration) {
        self.status = EventStatus::Failed;
        self.processing_time_ms = Some(duration_ms(elapsed));
    }

    /// Consume one retry. The count is never reset by re-admission.
    pub fn mark_retry(&mut self) {
        self.retry_count += 1;
        self.status = EventStatus::Retry;
    }

    pub fn mark_dead_letter(&mut self) {
        self.status = EventStatus::DeadLetter;
    }

    /// Back to `Pending` with a fresh retry budget (manual dead-letter requeue).
    pub fn reset_for_requeue(&mut self) {
        self.status = EventStatus::Pending;
        self.retry_count = 0;
        self.processing_time_ms = None;
    }

    /// Build the copy published by a replay: fresh id and timestamp, same
    /// correlation, provenance recorded in `parent_event_id` and metadata.
    pub fn replay_copy(&self) -> Event {
        let mut metadata = self.metadata.clone();
        metadata.insert(
            REPLAYED_FROM_KEY.to_string(),
            Value::String(self.id.to_string()),
        );

        Event {
            id: EventId::new(),
            correlation_id: self.correlation_id,
            event_type: self.event_type.clone(),
            source: format!("replay:{}", self.source),
            timestamp: Utc::now(),
            data: self.data.clone(),
            metadata,
            priority: self.priority,
            status: EventStatus::Pending,
            parent_event_id: Some(self.id),
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            organization_id: self.organization_id,
            retry_count: 0,
            max_retries: self.max_retries,
            processing_time_ms: None,
        }
    }
}

pub(crate) fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

pub(crate) fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
