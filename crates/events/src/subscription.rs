//! Webhook subscriptions.
//!
//! The bus does not speak HTTP. Admitted events that some enabled subscription
//! wants are parked in an outbox; the periodic webhook task drains it into one
//! [`WebhookBatch`] per subscription, hands the batches to a
//! [`WebhookDeliveryPolicy`](crate::policy::WebhookDeliveryPolicy), and records
//! the [`DeliveryOutcome`]s it returns on the subscriptions.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use erpbus_core::{EventId, SubscriptionId};

use crate::event::{Event, EventType};
use crate::handler::HandlerFilters;
use crate::ring::RingBuffer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
    Patch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: SubscriptionId,
    pub webhook_url: String,
    #[serde(default)]
    pub http_method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Shared secret for payload signing.
    #[serde(default, skip_serializing)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub body_template: Option<String>,
    pub event_types: BTreeSet<EventType>,
    #[serde(default)]
    pub filters: HandlerFilters,
    pub enabled: bool,
    #[serde(default)]
    pub delivery_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn new(
        webhook_url: impl Into<String>,
        event_types: impl IntoIterator<Item = EventType>,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            webhook_url: webhook_url.into(),
            http_method: HttpMethod::Post,
            headers: BTreeMap::new(),
            secret_key: None,
            body_template: None,
            event_types: event_types.into_iter().collect(),
            filters: HandlerFilters::default(),
            enabled: true,
            delivery_count: 0,
            failure_count: 0,
            last_delivery_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.http_method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret_key = Some(secret.into());
        self
    }

    pub fn with_body_template(mut self, template: impl Into<String>) -> Self {
        self.body_template = Some(template.into());
        self
    }

    pub fn with_filters(mut self, filters: HandlerFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn wants(&self, event: &Event) -> bool {
        self.enabled && self.event_types.contains(&event.event_type) && self.filters.matches(event)
    }
}

/// Events owed to one subscription.
#[derive(Debug, Clone)]
pub struct WebhookBatch {
    pub subscription: WebhookSubscription,
    /// Oldest first.
    pub events: Vec<Event>,
}

/// Result of delivering one event to one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub subscription_id: SubscriptionId,
    pub event_id: EventId,
    pub success: bool,
}

impl DeliveryOutcome {
    pub fn delivered(subscription_id: SubscriptionId, event_id: EventId) -> Self {
        Self {
            subscription_id,
            event_id,
            success: true,
        }
    }

    pub fn failed(subscription_id: SubscriptionId, event_id: EventId) -> Self {
        Self {
            subscription_id,
            event_id,
            success: false,
        }
    }
}

#[derive(Debug)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<BTreeMap<SubscriptionId, WebhookSubscription>>,
    outbox: RingBuffer<Event>,
}

impl SubscriptionRegistry {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            subscriptions: RwLock::new(BTreeMap::new()),
            outbox: RingBuffer::new(outbox_capacity),
        }
    }

    pub fn add(&self, subscription: WebhookSubscription) -> SubscriptionId {
        let id = subscription.id;
        self.subscriptions.write().insert(id, subscription);
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        self.subscriptions.write().remove(&id).is_some()
    }

    pub fn get(&self, id: SubscriptionId) -> Option<WebhookSubscription> {
        self.subscriptions.read().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<WebhookSubscription> {
        self.subscriptions.read().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions.read().values().filter(|s| s.enabled).count()
    }

    pub fn wants_any(&self, event: &Event) -> bool {
        self.subscriptions.read().values().any(|s| s.wants(event))
    }

    /// Park an event for the next delivery tick. The oldest parked event is
    /// dropped once the outbox is full.
    pub fn enqueue(&self, event: Event) {
        if let Some(dropped) = self.outbox.push(event) {
            warn!(event_id = %dropped.id, "webhook outbox full; dropped oldest event");
        }
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Drain the outbox into one batch per enabled subscription that wants
    /// at least one of the parked events.
    pub fn take_batches(&self) -> Vec<WebhookBatch> {
        let events = self.outbox.drain();
        if events.is_empty() {
            return Vec::new();
        }

        self.subscriptions
            .read()
            .values()
            .filter_map(|subscription| {
                let wanted: Vec<Event> =
                    events.iter().filter(|e| subscription.wants(e)).cloned().collect();
                (!wanted.is_empty()).then(|| WebhookBatch {
                    subscription: subscription.clone(),
                    events: wanted,
                })
            })
            .collect()
    }

    /// Apply outcomes returned by a delivery policy; returns how many matched
    /// a known subscription.
    pub fn record_outcomes(&self, outcomes: &[DeliveryOutcome]) -> usize {
        outcomes
            .iter()
            .filter(|o| self.record_delivery(o.subscription_id, o.success))
            .count()
    }

    /// Record one delivery attempt.
    pub fn record_delivery(&self, id: SubscriptionId, success: bool) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let Some(subscription) = subscriptions.get_mut(&id) else {
            return false;
        };
        subscription.delivery_count += 1;
        if !success {
            subscription.failure_count += 1;
        }
        subscription.last_delivery_at = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_list_and_remove() {
        let registry = SubscriptionRegistry::new(16);
        let id = registry.add(
            WebhookSubscription::new("https://hooks.example.com/orders", [EventType::OrderCreated])
                .with_header("X-Api-Key", "k")
                .with_secret("s3cret"),
        );

        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.get(id).unwrap().http_method, HttpMethod::Post);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
    }

    #[test]
    fn secret_is_never_serialized() {
        let subscription =
            WebhookSubscription::new("https://hooks.example.com", [EventType::AuditLog])
                .with_secret("s3cret");
        let json = serde_json::to_value(&subscription).unwrap();
        assert!(json.get("secret_key").is_none());
        assert_eq!(json["http_method"], "POST");
    }

    #[test]
    fn delivery_counters_accumulate() {
        let registry = SubscriptionRegistry::new(16);
        let id = registry.add(WebhookSubscription::new(
            "https://hooks.example.com",
            [EventType::AuditLog],
        ));

        registry.record_delivery(id, true);
        registry.record_delivery(id, false);

        let subscription = registry.get(id).unwrap();
        assert_eq!(subscription.delivery_count, 2);
        assert_eq!(subscription.failure_count, 1);
        assert!(subscription.last_delivery_at.is_some());
    }

    #[test]
    fn wants_checks_type_and_filters() {
        let subscription =
            WebhookSubscription::new("https://hooks.example.com", [EventType::OrderCreated])
                .with_filters(HandlerFilters::new().with("channel", "web"));

        let web = Event::new(EventType::OrderCreated, "sales").with_field("channel", "web");
        let pos = Event::new(EventType::OrderCreated, "sales").with_field("channel", "pos");
        let other = Event::new(EventType::InvoiceIssued, "billing").with_field("channel", "web");

        assert!(subscription.wants(&web));
        assert!(!subscription.wants(&pos));
        assert!(!subscription.wants(&other));
    }

    #[test]
    fn outbox_is_split_per_subscription() {
        let registry = SubscriptionRegistry::new(16);
        let orders = registry.add(WebhookSubscription::new(
            "https://hooks.example.com/orders",
            [EventType::OrderCreated],
        ));
        let everything = registry.add(WebhookSubscription::new(
            "https://hooks.example.com/all",
            [EventType::OrderCreated, EventType::InvoiceIssued],
        ));

        let order = Event::new(EventType::OrderCreated, "sales");
        let invoice = Event::new(EventType::InvoiceIssued, "billing");
        let stock = Event::new(EventType::InventoryAdjusted, "inventory");
        assert!(registry.wants_any(&order));
        assert!(!registry.wants_any(&stock));

        registry.enqueue(order.clone());
        registry.enqueue(invoice.clone());
        assert_eq!(registry.outbox_len(), 2);

        let batches = registry.take_batches();
        assert_eq!(registry.outbox_len(), 0);
        assert_eq!(batches.len(), 2);

        let ids = |id: SubscriptionId| -> Vec<EventId> {
            batches
                .iter()
                .find(|b| b.subscription.id == id)
                .map(|b| b.events.iter().map(|e| e.id).collect())
                .unwrap_or_default()
        };
        assert_eq!(ids(orders), vec![order.id]);
        assert_eq!(ids(everything), vec![order.id, invoice.id]);
        assert!(registry.take_batches().is_empty());
    }

    #[test]
    fn outcomes_update_known_subscriptions_only() {
        let registry = SubscriptionRegistry::new(16);
        let id = registry.add(WebhookSubscription::new(
            "https://hooks.example.com",
            [EventType::AuditLog],
        ));
        let event_id = EventId::new();

        let recorded = registry.record_outcomes(&[
            DeliveryOutcome::delivered(id, event_id),
            DeliveryOutcome::failed(id, event_id),
            DeliveryOutcome::delivered(SubscriptionId::new(), event_id),
        ]);

        assert_eq!(recorded, 2);
        let subscription = registry.get(id).unwrap();
        assert_eq!(subscription.delivery_count, 2);
        assert_eq!(subscription.failure_count, 1);
    }
}
