//! Opaque keyed record store backing the built-in CRUD executors.
//!
//! Records are JSON documents keyed by `(project, context, entity,
//! record_id)`. The runtime does not interpret the document beyond its id.

use matrix_protocol::now_millis;
use serde_json::Value;
use sqlx::Row;

use crate::error::{DbError, Result};
use crate::DbPool;

/// Key of an entity's record space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKey {
    pub project: String,
    pub context: String,
    pub entity: String,
}

#[derive(Clone)]
pub struct RecordStore {
    pool: DbPool,
}

impl RecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, key: &EntityKey, record_id: &str, data: &Value) -> Result<()> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO entity_records (project, context, entity, record_id, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&key.project)
        .bind(&key.context)
        .bind(&key.entity)
        .bind(record_id)
        .bind(data.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(DbError::already_exists(format!("record {record_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update(&self, key: &EntityKey, record_id: &str, data: &Value) -> Result<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE entity_records SET data = ?, updated_at = ?
            WHERE project = ? AND context = ? AND entity = ? AND record_id = ?
            "#,
        )
        .bind(data.to_string())
        .bind(now_millis())
        .bind(&key.project)
        .bind(&key.context)
        .bind(&key.entity)
        .bind(record_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DbError::not_found(format!("record {record_id}")));
        }
        Ok(())
    }

    pub async fn delete(&self, key: &EntityKey, record_id: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            r#"
            DELETE FROM entity_records
            WHERE project = ? AND context = ? AND entity = ? AND record_id = ?
            "#,
        )
        .bind(&key.project)
        .bind(&key.context)
        .bind(&key.entity)
        .bind(record_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DbError::not_found(format!("record {record_id}")));
        }
        Ok(())
    }

    pub async fn get(&self, key: &EntityKey, record_id: &str) -> Result<Option<Value>> {
        let data: Option<String> = sqlx::query_scalar(
            r#"
            SELECT data FROM entity_records
            WHERE project = ? AND context = ? AND entity = ? AND record_id = ?
            "#,
        )
        .bind(&key.project)
        .bind(&key.context)
        .bind(&key.entity)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        match data {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// One page of an entity's records plus the total count.
    pub async fn query(&self, key: &EntityKey, page: i64, size: i64) -> Result<(Vec<Value>, i64)> {
        let size = size.clamp(1, 500);
        let offset = (page.max(1) - 1) * size;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entity_records WHERE project = ? AND context = ? AND entity = ?",
        )
        .bind(&key.project)
        .bind(&key.context)
        .bind(&key.entity)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT data FROM entity_records
            WHERE project = ? AND context = ? AND entity = ?
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(&key.project)
        .bind(&key.context)
        .bind(&key.entity)
        .bind(size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut list = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("data")?;
            list.push(serde_json::from_str(&raw)?);
        }
        Ok((list, total))
    }
}
