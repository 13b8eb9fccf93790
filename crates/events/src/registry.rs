//! Handler registry: handlers by id plus a per-event-type index kept in
//! execution order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use erpbus_core::HandlerId;

use crate::event::{Event, EventType};
use crate::handler::{HandlerInfo, HandlerRegistration, RegisteredHandler};

#[derive(Debug, Default)]
struct RegistryState {
    handlers: HashMap<HandlerId, Arc<RegisteredHandler>>,
    by_type: HashMap<EventType, Vec<HandlerId>>,
}

#[derive(Debug)]
pub struct HandlerRegistry {
    default_timeout: Duration,
    state: RwLock<RegistryState>,
}

impl HandlerRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Store a handler and index it under each of its event types.
    ///
    /// Each type's list stays sorted ascending by handler priority; handlers
    /// with equal priority keep registration order.
    pub fn register(&self, registration: HandlerRegistration) -> Arc<RegisteredHandler> {
        let handler = Arc::new(RegisteredHandler::from_registration(
            registration,
            self.default_timeout,
        ));

        let mut state = self.state.write();
        let RegistryState { handlers, by_type } = &mut *state;
        handlers.insert(handler.id, handler.clone());

        for event_type in &handler.event_types {
            let ids = by_type.entry(event_type.clone()).or_default();
            ids.push(handler.id);
            ids.sort_by_key(|id| handlers.get(id).map_or(i32::MAX, |h| h.priority));
        }

        handler
    }

    /// Remove a handler from every index. `false` if the id is unknown.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut state = self.state.write();
        let Some(handler) = state.handlers.remove(&id) else {
            return false;
        };

        for event_type in &handler.event_types {
            if let Some(ids) = state.by_type.get_mut(event_type) {
                ids.retain(|h| *h != id);
                if ids.is_empty() {
                    state.by_type.remove(event_type);
                }
            }
        }
        true
    }

    /// Handlers subscribed to `event_type`, in execution order.
    pub fn resolve(&self, event_type: &EventType) -> Vec<Arc<RegisteredHandler>> {
        let state = self.state.read();
        state
            .by_type
            .get(event_type)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.handlers.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Handlers that should run for `event`, in execution order.
    pub fn matching(&self, event: &Event) -> Vec<Arc<RegisteredHandler>> {
        self.resolve(&event.event_type)
            .into_iter()
            .filter(|handler| handler.matches(event))
            .collect()
    }

    pub fn get(&self, id: HandlerId) -> Option<Arc<RegisteredHandler>> {
        self.state.read().handlers.get(&id).cloned()
    }

    pub fn set_enabled(&self, id: HandlerId, enabled: bool) -> bool {
        match self.get(id) {
            Some(handler) => {
                handler.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().handlers.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.state
            .read()
            .handlers
            .values()
            .filter(|h| h.is_enabled())
            .count()
    }

    /// Info for every handler, ordered by priority then name.
    pub fn snapshot(&self) -> Vec<HandlerInfo> {
        let mut infos: Vec<HandlerInfo> = self
            .state
            .read()
            .handlers
            .values()
            .map(|h| h.info())
            .collect();
        infos.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        infos
    }

    pub fn counts_by_event_type(&self) -> BTreeMap<String, usize> {
        self.state
            .read()
            .by_type
            .iter()
            .map(|(event_type, ids)| (event_type.to_string(), ids.len()))
            .collect()
    }
}
