//! TTL cache of Gateway-authoritative domain metadata.
//!
//! Entities, attributes, event schemas and constants are owned by the
//! Gateway; this cache reads through on miss and answers from memory for
//! the TTL. Gateway failures degrade to empty results so the caller's
//! request fails soft instead of erroring the whole pipeline.

use matrix_protocol::defaults::{INTERNAL_VERSION, SPLIT};
use matrix_protocol::{Constant, EntityAttribute, EntityEvent, Event, EventType, PayloadType};
use moka::sync::Cache;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::client::IntranetClient;

#[derive(Clone)]
enum DomainEntry {
    Entity(Arc<Value>),
    Attrs(Arc<Vec<EntityAttribute>>),
    Events(Arc<Vec<EntityEvent>>),
    Constants(Arc<Vec<Constant>>),
}

#[derive(Clone)]
struct CachedEntry {
    entry: DomainEntry,
    /// Approximate in-memory cost in bytes, weighed at admission.
    cost: u32,
}

/// Read-through cache over the Gateway's domain metadata.
pub struct DomainCache {
    cache: Cache<String, CachedEntry>,
    client: Arc<IntranetClient>,
    gateway: String,
}

impl DomainCache {
    pub fn new(
        client: Arc<IntranetClient>,
        gateway: impl Into<String>,
        max_capacity_mib: u64,
        ttl: Duration,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity_mib * 1024 * 1024)
            .time_to_live(ttl)
            .weigher(|_key: &String, value: &CachedEntry| value.cost.max(1))
            .build();
        Self {
            cache,
            client,
            gateway: gateway.into(),
        }
    }

    /// Entity definition, or None when unknown or the Gateway is down.
    pub async fn entity(
        &self,
        project: &str,
        context: &str,
        entity: &str,
        version: &str,
    ) -> Option<Arc<Value>> {
        if version == INTERNAL_VERSION || incomplete(&[project, context, entity, version]) {
            return None;
        }
        let key = entity_key(project, context, entity, version);
        if let Some(CachedEntry {
            entry: DomainEntry::Entity(value),
            ..
        }) = self.cache.get(&key)
        {
            return Some(value);
        }

        let payload = self
            .fetch(
                EventType::WtgGetEntity,
                &join_params(&[project, version, context, entity]),
            )
            .await?;
        let value: Value = serde_json::from_slice(&payload).ok()?;
        let value = Arc::new(value);
        self.insert(key, DomainEntry::Entity(Arc::clone(&value)), payload.len());
        Some(value)
    }

    /// Attribute metadata; empty on unknown entity or Gateway failure.
    pub async fn entity_attrs(
        &self,
        project: &str,
        context: &str,
        entity: &str,
        version: &str,
    ) -> Arc<Vec<EntityAttribute>> {
        if incomplete(&[project, context, entity, version]) {
            return Arc::new(Vec::new());
        }
        let key = attrs_key(project, context, entity, version);
        if let Some(CachedEntry {
            entry: DomainEntry::Attrs(attrs),
            ..
        }) = self.cache.get(&key)
        {
            return attrs;
        }

        let Some(payload) = self
            .fetch(
                EventType::WtgGetEntityAttrs,
                &join_params(&[project, version, context, entity]),
            )
            .await
        else {
            return Arc::new(Vec::new());
        };
        let attrs: Vec<EntityAttribute> = match serde_json::from_slice(&payload) {
            Ok(attrs) => attrs,
            Err(e) => {
                warn!("Unparsable entity attrs for {key}: {e}");
                return Arc::new(Vec::new());
            }
        };
        let attrs = Arc::new(attrs);
        self.insert(key, DomainEntry::Attrs(Arc::clone(&attrs)), payload.len());
        attrs
    }

    /// Event schemas of an entity; empty for the internal version.
    pub async fn entity_events(
        &self,
        project: &str,
        context: &str,
        entity: &str,
        version: &str,
    ) -> Arc<Vec<EntityEvent>> {
        if version == INTERNAL_VERSION || incomplete(&[project, context, entity, version]) {
            return Arc::new(Vec::new());
        }
        let key = events_key(project, context, entity, version);
        if let Some(CachedEntry {
            entry: DomainEntry::Events(events),
            ..
        }) = self.cache.get(&key)
        {
            return events;
        }

        let Some(payload) = self
            .fetch(
                EventType::WtgGetEntityEvents,
                &join_params(&[project, version, context, entity]),
            )
            .await
        else {
            return Arc::new(Vec::new());
        };
        let events: Vec<EntityEvent> = match serde_json::from_slice(&payload) {
            Ok(events) => events,
            Err(e) => {
                warn!("Unparsable entity events for {key}: {e}");
                return Arc::new(Vec::new());
            }
        };
        let events = Arc::new(events);
        self.insert(key, DomainEntry::Events(Arc::clone(&events)), payload.len());
        events
    }

    /// Schema of one concrete event, by code.
    pub async fn find_entity_event(&self, event: &Event) -> Option<EntityEvent> {
        let events = self
            .entity_events(&event.project, &event.context, &event.entity, &event.version)
            .await;
        events.iter().find(|e| e.code == event.event).cloned()
    }

    /// Constants of a project dictionary.
    pub async fn constants(&self, project: &str, dict: &str) -> Arc<Vec<Constant>> {
        if incomplete(&[project, dict]) {
            return Arc::new(Vec::new());
        }
        let key = constants_key(project, dict);
        if let Some(CachedEntry {
            entry: DomainEntry::Constants(constants),
            ..
        }) = self.cache.get(&key)
        {
            return constants;
        }

        let Some(payload) = self
            .fetch(EventType::WtgGetConstants, &join_params(&[project, dict]))
            .await
        else {
            return Arc::new(Vec::new());
        };
        let constants: Vec<Constant> = match serde_json::from_slice(&payload) {
            Ok(constants) => constants,
            Err(e) => {
                warn!("Unparsable constants for {key}: {e}");
                return Arc::new(Vec::new());
            }
        };
        let constants = Arc::new(constants);
        self.insert(
            key,
            DomainEntry::Constants(Arc::clone(&constants)),
            payload.len(),
        );
        constants
    }

    /// Drop everything; the next lookups read through again.
    pub fn flush(&self) {
        self.cache.invalidate_all();
        debug!("Domain cache flushed");
    }

    async fn fetch(&self, event_type: EventType, params: &str) -> Option<Vec<u8>> {
        match self
            .client
            .post(
                &self.gateway,
                event_type.as_u16(),
                PayloadType::Text,
                params.as_bytes(),
            )
            .await
        {
            Ok(response) if response.status_code == 200 => Some(response.payload),
            Ok(response) => {
                warn!(
                    "Gateway answered {} for {:?} {}",
                    response.status_code, event_type, params
                );
                None
            }
            Err(e) => {
                warn!("Gateway call {:?} failed: {}", event_type, e);
                None
            }
        }
    }

    fn insert(&self, key: String, entry: DomainEntry, cost: usize) {
        self.cache.insert(
            key,
            CachedEntry {
                entry,
                cost: cost.min(u32::MAX as usize) as u32,
            },
        );
    }
}

fn incomplete(parts: &[&str]) -> bool {
    parts.iter().any(|part| part.trim().is_empty())
}

fn join_params(parts: &[&str]) -> String {
    parts.join(SPLIT)
}

fn entity_key(project: &str, context: &str, entity: &str, version: &str) -> String {
    format!("entity:{project}:{context}:{entity}:{version}")
}

fn attrs_key(project: &str, context: &str, entity: &str, version: &str) -> String {
    format!("entity_attr:{project}:{context}:{entity}:{version}")
}

fn events_key(project: &str, context: &str, entity: &str, version: &str) -> String {
    format!("entity_event:{project}:{context}:{entity}:{version}")
}

fn constants_key(project: &str, dict: &str) -> String {
    format!("constant:{project}:{dict}")
}
