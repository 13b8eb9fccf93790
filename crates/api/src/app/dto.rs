use core::str::FromStr;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use erpbus_core::{CorrelationId, EventId, OrganizationId, TenantId, UserId};
use erpbus_events::{Event, EventPriority, EventType};

use crate::app::errors;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 1000;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct PublishEventRequest {
    pub event_type: String,
    pub source: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    pub priority: Option<String>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub correlation_id: Option<String>,
    pub parent_event_id: Option<String>,
    pub max_retries: Option<u32>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl PublishEventRequest {
    /// Build the event, rejecting malformed ids and priorities with a 400.
    pub fn into_event(self) -> Result<Event, axum::response::Response> {
        let mut event = Event::new(EventType::from(self.event_type), self.source);

        if let Some(data) = self.data {
            event = event.with_data(data);
        }
        if let Some(metadata) = self.metadata {
            event.metadata = metadata;
        }
        if let Some(raw) = self.priority {
            let priority = EventPriority::from_str(&raw).map_err(|e| {
                errors::json_error(StatusCode::BAD_REQUEST, "invalid_priority", e.to_string())
            })?;
            event = event.with_priority(priority);
        }
        if let Some(raw) = self.tenant_id {
            event = event.with_tenant(parse_id::<TenantId>("tenant_id", &raw)?);
        }
        if let Some(raw) = self.user_id {
            event = event.with_user(parse_id::<UserId>("user_id", &raw)?);
        }
        if let Some(raw) = self.organization_id {
            event = event.with_organization(parse_id::<OrganizationId>("organization_id", &raw)?);
        }
        if let Some(raw) = self.correlation_id {
            event = event.with_correlation_id(parse_id::<CorrelationId>("correlation_id", &raw)?);
        }
        if let Some(raw) = self.parent_event_id {
            event = event.with_parent(parse_id::<EventId>("parent_event_id", &raw)?);
        }
        if let Some(max_retries) = self.max_retries {
            event = event.with_max_retries(max_retries);
        }
        if let Some(timestamp) = self.timestamp {
            event = event.at(timestamp);
        }

        Ok(event)
    }
}

#[derive(Debug, Deserialize)]
pub struct ReplayRequest {
    pub from: DateTime<Utc>,
    pub to: Option<DateTime<Utc>>,
    pub event_types: Option<Vec<String>>,
}

impl ReplayRequest {
    pub fn event_types(&self) -> Option<Vec<EventType>> {
        self.event_types
            .as_ref()
            .map(|types| types.iter().map(|t| EventType::from(t.as_str())).collect())
    }
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

// -------------------------
// Query parameters
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    /// Requested limit, defaulting to 50 and capped at 1000.
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)
    }
}

pub fn parse_id<T>(field: &'static str, raw: &str) -> Result<T, axum::response::Response>
where
    T: FromStr,
{
    raw.trim()
        .parse::<T>()
        .map_err(|_| errors::invalid_id(field, raw))
}
