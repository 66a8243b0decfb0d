//! Per-request context threaded through dispatch, validation and execution.

use matrix_protocol::{EntityEvent, Event, EventResponse};
use serde_json::{Map, Value};

/// Which listener admitted the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Public,
    Intranet,
}

/// Everything an executor may need about the in-flight event.
///
/// Contexts are built by the dispatcher after validation and handed to the
/// executor behind an `Arc`; executors treat them as read-only snapshots.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub event: Event,
    pub entity_event: EntityEvent,
    /// Resolved user id; empty when anonymous.
    pub user_id: String,
    pub source_ip: String,
    pub call_chain: String,
    pub surface: Surface,
    /// Coerced and validated event parameters.
    pub params: Map<String, Value>,
    /// Set by an interceptor that stops the chain.
    pub response: Option<EventResponse>,
}

impl EventContext {
    pub fn new(event: Event, entity_event: EntityEvent, surface: Surface) -> Self {
        Self {
            event,
            entity_event,
            user_id: String::new(),
            source_ip: String::new(),
            call_chain: String::new(),
            surface,
            params: Map::new(),
            response: None,
        }
    }

    /// Unique label of the in-flight event.
    pub fn label(&self) -> String {
        self.event.unique_label()
    }

    pub fn param(&self, code: &str) -> Option<&Value> {
        self.params.get(code)
    }

    pub fn param_str(&self, code: &str) -> Option<&str> {
        self.params.get(code).and_then(Value::as_str)
    }
}
