//! Executor surface: traits for executors, interceptors, filters and custom
//! field parsers, plus the stock CRUD executors backing BUILTIN events.

use async_trait::async_trait;
use matrix_db::records::EntityKey;
use matrix_db::{DbError, RecordStore};
use matrix_protocol::{EventResponse, ResponseCode};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::context::EventContext;

/// Ordered-chain control: `Stop` ends the chain at this element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    Continue,
    Stop,
}

/// A business executor bound to an entity event.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: Arc<EventContext>) -> EventResponse;
}

/// Runs before validation; may settle the response and stop the chain.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, ctx: &mut EventContext) -> FlowControl;
}

/// Runs over the serialized-to-be response; may rewrite it.
#[async_trait]
pub trait Filter: Send + Sync {
    async fn filter(&self, ctx: &EventContext, response: &mut EventResponse) -> FlowControl;
}

/// App-registered coercion for `custom` attribute fields.
pub trait CustomFieldParser: Send + Sync {
    fn parse(&self, code: &str, value: &Value) -> Result<Value, String>;
}

// ============================================================================
// Built-in CRUD executors
// ============================================================================

/// Resolve a BUILTIN executor by its registered name.
pub fn builtin_executor(name: &str, records: &RecordStore) -> Option<Arc<dyn Executor>> {
    match name {
        "create" => Some(Arc::new(CreateExecutor::new(records.clone()))),
        "update" => Some(Arc::new(UpdateExecutor::new(records.clone()))),
        "delete" => Some(Arc::new(DeleteExecutor::new(records.clone()))),
        "query" => Some(Arc::new(QueryExecutor::new(records.clone()))),
        _ => None,
    }
}

fn entity_key(ctx: &EventContext) -> EntityKey {
    EntityKey {
        project: ctx.event.project.clone(),
        context: ctx.event.context.clone(),
        entity: ctx.event.entity.clone(),
    }
}

fn db_failure(e: DbError) -> EventResponse {
    match e {
        DbError::AlreadyExists(msg) => EventResponse::error(ResponseCode::AlreadyExist, msg),
        DbError::NotFound(msg) => EventResponse::error(ResponseCode::FailToProcess, msg),
        other => EventResponse::error(ResponseCode::FailToProcess, other.to_string()),
    }
}

pub struct CreateExecutor {
    records: RecordStore,
}

impl CreateExecutor {
    pub fn new(records: RecordStore) -> Self {
        Self { records }
    }
}

#[async_trait]
impl Executor for CreateExecutor {
    async fn execute(&self, ctx: Arc<EventContext>) -> EventResponse {
        let mut record: Map<String, Value> = ctx.params.clone();
        let id = match record.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = Uuid::new_v4().simple().to_string();
                record.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let value = Value::Object(record);
        match self.records.insert(&entity_key(&ctx), &id, &value).await {
            Ok(()) => EventResponse::with_record(value),
            Err(e) => db_failure(e),
        }
    }
}

pub struct UpdateExecutor {
    records: RecordStore,
}

impl UpdateExecutor {
    pub fn new(records: RecordStore) -> Self {
        Self { records }
    }
}

#[async_trait]
impl Executor for UpdateExecutor {
    async fn execute(&self, ctx: Arc<EventContext>) -> EventResponse {
        let Some(id) = ctx.param_str("id").map(str::to_string) else {
            return EventResponse::error(ResponseCode::MissingParam, "id is required");
        };

        let key = entity_key(&ctx);
        let existing = match self.records.get(&key, &id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                return EventResponse::error(ResponseCode::FailToProcess, "record not found")
            }
            Err(e) => return db_failure(e),
        };

        // Merge the incoming params over the stored document.
        let mut merged = existing.as_object().cloned().unwrap_or_default();
        for (code, value) in &ctx.params {
            merged.insert(code.clone(), value.clone());
        }

        let value = Value::Object(merged);
        match self.records.update(&key, &id, &value).await {
            Ok(()) => EventResponse::with_record(value),
            Err(e) => db_failure(e),
        }
    }
}

pub struct DeleteExecutor {
    records: RecordStore,
}

impl DeleteExecutor {
    pub fn new(records: RecordStore) -> Self {
        Self { records }
    }
}

#[async_trait]
impl Executor for DeleteExecutor {
    async fn execute(&self, ctx: Arc<EventContext>) -> EventResponse {
        let Some(id) = ctx.param_str("id").map(str::to_string) else {
            return EventResponse::error(ResponseCode::MissingParam, "id is required");
        };

        match self.records.delete(&entity_key(&ctx), &id).await {
            Ok(()) => EventResponse::success(),
            Err(e) => db_failure(e),
        }
    }
}

pub struct QueryExecutor {
    records: RecordStore,
}

impl QueryExecutor {
    pub fn new(records: RecordStore) -> Self {
        Self { records }
    }
}

#[async_trait]
impl Executor for QueryExecutor {
    async fn execute(&self, ctx: Arc<EventContext>) -> EventResponse {
        let key = entity_key(&ctx);

        // Single-record lookup when an id parameter is present.
        if let Some(id) = ctx.param_str("id") {
            return match self.records.get(&key, id).await {
                Ok(Some(record)) => EventResponse::with_record(record),
                Ok(None) => EventResponse::with_page(Vec::new(), 0, 0, 1),
                Err(e) => db_failure(e),
            };
        }

        let page = ctx.param("page").and_then(Value::as_i64).unwrap_or(1);
        let size = ctx.param("size").and_then(Value::as_i64).unwrap_or(20);
        match self.records.query(&key, page, size).await {
            Ok((list, total)) => {
                let size = list.len() as i64;
                EventResponse::with_page(list, total, size, page)
            }
            Err(e) => db_failure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Surface;
    use matrix_protocol::{EntityEvent, Event};

    async fn ctx_with_params(params: Value) -> (EventContext, RecordStore) {
        let pool = matrix_db::open_in_memory().await.unwrap();
        let records = RecordStore::new(pool);

        let event = Event {
            project: "demo".into(),
            context: "main".into(),
            entity: "user_info".into(),
            event: "create".into(),
            version: "0.0.1".into(),
            ..Default::default()
        };
        let mut ctx = EventContext::new(event, EntityEvent::default(), Surface::Intranet);
        ctx.params = params.as_object().cloned().unwrap_or_default();
        (ctx, records)
    }

    #[tokio::test]
    async fn test_create_generates_id() {
        let (ctx, records) = ctx_with_params(serde_json::json!({"name": "alice"})).await;
        let executor = CreateExecutor::new(records);

        let response = executor.execute(Arc::new(ctx)).await;
        assert!(response.is_success());
        assert_eq!(response.total, 1);

        let record = &response.list[0];
        assert_eq!(record["name"], "alice");
        assert!(!record["id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_then_query_then_delete() {
        let (ctx, records) = ctx_with_params(serde_json::json!({"id": "u1", "name": "bob"})).await;
        CreateExecutor::new(records.clone())
            .execute(Arc::new(ctx.clone()))
            .await;

        // Duplicate create is rejected.
        let dup = CreateExecutor::new(records.clone())
            .execute(Arc::new(ctx.clone()))
            .await;
        assert_eq!(dup.code, ResponseCode::AlreadyExist.as_str());

        let mut query_ctx = ctx.clone();
        query_ctx.params = serde_json::json!({"id": "u1"})
            .as_object()
            .cloned()
            .unwrap();
        let found = QueryExecutor::new(records.clone())
            .execute(Arc::new(query_ctx.clone()))
            .await;
        assert_eq!(found.list[0]["name"], "bob");

        let deleted = DeleteExecutor::new(records.clone())
            .execute(Arc::new(query_ctx.clone()))
            .await;
        assert!(deleted.is_success());

        let gone = QueryExecutor::new(records).execute(Arc::new(query_ctx)).await;
        assert!(gone.list.is_empty());
    }

    #[tokio::test]
    async fn test_update_merges() {
        let (ctx, records) =
            ctx_with_params(serde_json::json!({"id": "u1", "name": "bob", "age": 30})).await;
        CreateExecutor::new(records.clone())
            .execute(Arc::new(ctx.clone()))
            .await;

        let mut update_ctx = ctx.clone();
        update_ctx.params = serde_json::json!({"id": "u1", "name": "robert"})
            .as_object()
            .cloned()
            .unwrap();
        let updated = UpdateExecutor::new(records)
            .execute(Arc::new(update_ctx))
            .await;
        assert!(updated.is_success());
        assert_eq!(updated.list[0]["name"], "robert");
        assert_eq!(updated.list[0]["age"], 30);
    }

    #[tokio::test]
    async fn test_builtin_lookup() {
        let pool = matrix_db::open_in_memory().await.unwrap();
        let records = RecordStore::new(pool);
        for name in ["create", "update", "delete", "query"] {
            assert!(builtin_executor(name, &records).is_some());
        }
        assert!(builtin_executor("sql", &records).is_none());
    }
}
